//! Trial: the read side of a persisted trial directory
//!
//! Lazily loads the record on first derived access and caches it. All
//! accessors serve the cached view, even if stale, until [`Trial::reload`]
//! discards it; that is the only supported way to observe updates from a
//! tracker that is still writing.

use std::hash::{Hash, Hasher};
use std::io::Read;
use std::sync::{Arc, OnceLock};

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::codec;
use crate::error::{Error, Result};
use crate::record::{TrialRecord, TrialState, RECORD_FILE};
use crate::storage::{self, Storage, StorageRegistry};
use crate::tracker::TRACEBACK_FILE;

/// Read handle to one trial directory.
pub struct Trial {
    path: String,
    storage: Arc<dyn Storage>,
    record: OnceLock<TrialRecord>,
    attached: OnceLock<Vec<String>>,
}

impl Trial {
    /// Open a trial directory by path or URI, resolving the storage backend
    /// through the default registry.
    ///
    /// Nothing is read until a derived field is accessed.
    ///
    /// # Errors
    ///
    /// Fails when no backend claims the URI scheme.
    pub fn open(path: &str) -> Result<Self> {
        let (storage, local) = StorageRegistry::new().resolve(path)?;
        Ok(Self::with_storage(local, storage))
    }

    /// Open a trial directory on an already-resolved backend.
    #[must_use]
    pub fn with_storage(path: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            path: path.into(),
            storage,
            record: OnceLock::new(),
            attached: OnceLock::new(),
        }
    }

    /// The trial directory path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Discard all cached state, forcing the next access to re-read storage.
    pub fn reload(&mut self) {
        self.record = OnceLock::new();
        self.attached = OnceLock::new();
    }

    /// The cached record, loading it on first access.
    ///
    /// # Errors
    ///
    /// Fails when the record file is missing or undecodable.
    pub fn record(&self) -> Result<&TrialRecord> {
        if let Some(record) = self.record.get() {
            return Ok(record);
        }
        let reader = self.storage.open_read(&format!("{}/{RECORD_FILE}", self.path))?;
        let record = codec::decode_record(reader)?;
        Ok(self.record.get_or_init(|| record))
    }

    /// Trial identifier.
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be loaded.
    pub fn tid(&self) -> Result<&str> {
        Ok(&self.record()?.tid)
    }

    /// Unique identifier.
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be loaded.
    pub fn uid(&self) -> Result<&str> {
        Ok(&self.record()?.uid)
    }

    /// Captured metadata.
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be loaded.
    pub fn meta(&self) -> Result<&Mapping> {
        Ok(&self.record()?.meta)
    }

    /// Call parameters.
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be loaded.
    pub fn params(&self) -> Result<&Mapping> {
        Ok(&self.record()?.params)
    }

    /// Informed fields.
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be loaded.
    pub fn info(&self) -> Result<&Mapping> {
        Ok(&self.record()?.info)
    }

    /// Last flushed lifecycle state.
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be loaded.
    pub fn status(&self) -> Result<TrialState> {
        Ok(self.record()?.state)
    }

    /// The trial's result.
    ///
    /// Returns `None` for a trial that never completed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrialFailed`] carrying the stored error string and,
    /// when retrievable, the attached traceback text, for trials whose record
    /// shows a failure.
    pub fn result(&self) -> Result<Option<Value>> {
        let record = self.record()?;
        if let Some(error) = &record.error {
            let traceback = self.read_attachment_text(TRACEBACK_FILE).ok();
            if let Some(t) = &traceback {
                debug!("{t}");
            }
            return Err(Error::TrialFailed {
                error: error.clone(),
                traceback,
            });
        }
        Ok(record.result.clone())
    }

    /// Attachment file names in the trial directory, excluding the record.
    ///
    /// Nested attachments are listed with their directory-relative path,
    /// e.g. `logs/out.txt`.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be listed.
    pub fn attached(&self) -> Result<&[String]> {
        if let Some(names) = self.attached.get() {
            return Ok(names);
        }
        let names: Vec<String> = self
            .storage
            .list_all(&self.path)?
            .into_iter()
            .filter(|n| n != RECORD_FILE)
            .collect();
        Ok(self.attached.get_or_init(|| names))
    }

    /// Open a named attachment for reading.
    ///
    /// # Errors
    ///
    /// Fails when the attachment does not exist.
    pub fn attach(&self, name: &str) -> Result<Box<dyn Read>> {
        self.storage.open_read(&format!("{}/{name}", self.path))
    }

    fn read_attachment_text(&self, name: &str) -> Result<String> {
        storage::read_to_string(&*self.storage, &format!("{}/{name}", self.path))
    }
}

impl std::fmt::Debug for Trial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.record.get() {
            Some(record) => write!(f, "<Trial {:?}>", record.uid),
            None => write!(f, "<Trial at {:?}>", self.path),
        }
    }
}

/// Two trials are the same trial iff their `uid`s match.
impl PartialEq for Trial {
    fn eq(&self, other: &Self) -> bool {
        match (self.uid(), other.uid()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Hash for Trial {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid().unwrap_or_default().hash(state);
    }
}
