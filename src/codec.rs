//! Record format codec
//!
//! Serializes the trial record to a human-readable ordered mapping (YAML) and
//! back. Mapping keys keep insertion order on both directions.
//!
//! Fields whose encoded representation carries a tag the decoder cannot
//! reconstruct into the expected structure decode as
//! `serde_yaml::Value::Tagged` and re-encode losslessly as tag plus raw value,
//! so foreign records survive a read-modify-write cycle.

use std::io::Read;

use crate::error::Result;
use crate::record::TrialRecord;

/// Encode a record to its on-disk text form.
///
/// # Errors
///
/// Returns an error when a record field cannot be represented.
pub fn encode_record(record: &TrialRecord) -> Result<String> {
    Ok(serde_yaml::to_string(record)?)
}

/// Decode a record from a byte stream.
///
/// # Errors
///
/// Returns an error for unreadable streams or documents that do not match the
/// record schema.
pub fn decode_record(reader: impl Read) -> Result<TrialRecord> {
    Ok(serde_yaml::from_reader(reader)?)
}
