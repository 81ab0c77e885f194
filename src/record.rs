//! Trial record: the persisted, per-trial state document
//!
//! One record per trial directory. The record is created in memory when a
//! tracker starts (or restored from a snapshot on resume), mutated only
//! through the tracker, and persisted as a complete snapshot at every flush
//! checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

/// File name of the primary record inside a trial directory.
pub const RECORD_FILE: &str = "trial.yaml";

/// Parameter keys with this prefix are internal and never persisted.
pub const INTERNAL_PREFIX: &str = "_";

/// Lifecycle state of a trial.
///
/// `created → started` (fresh run) or `created → resumed` (snapshot loaded),
/// then `running`, then one of the terminal states `done` / `fail`. No
/// transition leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialState {
    /// Fresh record built, not yet running.
    Started,
    /// Restored from a snapshot.
    Resumed,
    /// Callable is executing.
    Running,
    /// Callable returned normally.
    Done,
    /// Callable failed.
    Fail,
}

impl TrialState {
    /// Whether this state admits no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Fail)
    }
}

impl std::fmt::Display for TrialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Resumed => "resumed",
            Self::Running => "running",
            Self::Done => "done",
            Self::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// Lifecycle timestamps. Each is set at most once, in non-decreasing order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    /// When the record was first built.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created: Option<DateTime<Utc>>,
    /// When the callable was first invoked.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started: Option<DateTime<Utc>>,
    /// When the trial was restored from a snapshot.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resumed: Option<DateTime<Utc>>,
    /// When the trial reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished: Option<DateTime<Utc>>,
}

impl Timestamps {
    pub(crate) fn mark_created(&mut self) {
        self.created.get_or_insert_with(Utc::now);
    }

    pub(crate) fn mark_started(&mut self) {
        self.started.get_or_insert_with(Utc::now);
    }

    pub(crate) fn mark_resumed(&mut self) {
        self.resumed.get_or_insert_with(Utc::now);
    }

    pub(crate) fn mark_finished(&mut self) {
        self.finished.get_or_insert_with(Utc::now);
    }
}

/// The persisted trial document.
///
/// Field order is the serialization order. `result` is present only when
/// `state = done`, `error` only when `state = fail`; the two never coexist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// Producer version string.
    #[serde(rename = "tracklet")]
    pub schema_version: String,
    /// Caller-supplied (or derived) trial identifier, non-unique across retries.
    pub tid: String,
    /// Process-generated unique identifier, assigned once at tracker creation.
    pub uid: String,
    /// Nested mapping populated by metadata providers.
    pub meta: Mapping,
    /// Lifecycle timestamps.
    pub at: Timestamps,
    /// Call parameters, fixed at trial start.
    pub params: Mapping,
    /// Lifecycle state.
    pub state: TrialState,
    /// Free-form fields accumulated via `inform`.
    pub info: Mapping,
    /// Final value, present only for `done` trials.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<Value>,
    /// String form of the failure, present only for `fail` trials.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl TrialRecord {
    /// Build a fresh record in the `started` state with `created` stamped.
    ///
    /// Parameter keys beginning with [`INTERNAL_PREFIX`] are dropped.
    #[must_use]
    pub fn new(tid: impl Into<String>, uid: impl Into<String>, meta: Mapping, params: &Mapping) -> Self {
        let mut at = Timestamps::default();
        at.mark_created();
        Self {
            schema_version: env!("CARGO_PKG_VERSION").to_string(),
            tid: tid.into(),
            uid: uid.into(),
            meta,
            at,
            params: filter_params(params),
            state: TrialState::Started,
            info: Mapping::new(),
            result: None,
            error: None,
        }
    }

    /// Enter the `done` terminal state with a result, clearing any error.
    pub(crate) fn finish_done(&mut self, result: Value) {
        self.state = TrialState::Done;
        self.result = Some(result);
        self.error = None;
    }

    /// Enter the `fail` terminal state with an error, clearing any result.
    pub(crate) fn finish_fail(&mut self, error: String) {
        self.state = TrialState::Fail;
        self.error = Some(error);
        self.result = None;
    }
}

/// Drop internal-prefixed keys from a params mapping.
#[must_use]
pub fn filter_params(params: &Mapping) -> Mapping {
    params
        .iter()
        .filter(|(k, _)| !matches!(k, Value::String(s) if s.starts_with(INTERNAL_PREFIX)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, i64)]) -> Mapping {
        pairs
            .iter()
            .map(|(k, v)| (Value::from(*k), Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_state_terminal() {
        assert!(TrialState::Done.is_terminal());
        assert!(TrialState::Fail.is_terminal());
        assert!(!TrialState::Running.is_terminal());
    }

    #[test]
    fn test_new_record_filters_internal_params() {
        let record = TrialRecord::new("t", "u", Mapping::new(), &params(&[("n", 3), ("_cache", 1)]));
        assert_eq!(record.state, TrialState::Started);
        assert!(record.at.created.is_some());
        assert!(record.params.contains_key("n"));
        assert!(!record.params.contains_key("_cache"));
    }

    #[test]
    fn test_result_error_exclusive() {
        let mut record = TrialRecord::new("t", "u", Mapping::new(), &Mapping::new());
        record.finish_fail("boom".to_string());
        assert_eq!(record.state, TrialState::Fail);
        assert!(record.result.is_none());

        record.finish_done(Value::from(7));
        assert_eq!(record.state, TrialState::Done);
        assert!(record.error.is_none());
        assert_eq!(record.result, Some(Value::from(7)));
    }

    #[test]
    fn test_timestamps_set_once() {
        let mut at = Timestamps::default();
        at.mark_started();
        let first = at.started;
        at.mark_started();
        assert_eq!(at.started, first);
    }
}
