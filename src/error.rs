//! Error types for tracklet
//!
//! Configuration and protocol-misuse errors are fatal and propagate
//! immediately. Failures inside an instrumented callable are captured into the
//! trial record instead, and only resurface as [`Error::TrialFailed`] when the
//! trial's result is read back.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// tracklet error types
#[derive(Error, Debug)]
pub enum Error {
    /// Global run entry point used before `init`
    #[error("runner is not initialized, call `tracklet::init(...)` first")]
    RunnerNotInitialized,

    /// A tracker is already active in this scope
    #[error("a tracker is already active in this scope")]
    DuplicateActiveTracker,

    /// Runner registry has no entry for the requested name
    #[error("no runner registered with name {name:?}")]
    UnknownRunner {
        /// Requested runner name
        name: String,
    },

    /// Runner registry has more than one entry for the requested name
    #[error("found {count} runners registered with name {name:?}, expected exactly one")]
    AmbiguousRunner {
        /// Requested runner name
        name: String,
        /// Number of matching registrations
        count: usize,
    },

    /// Tracker already has a callable bound
    #[error("tracker is already bound to a callable")]
    AlreadyBound,

    /// Tracker ran without a bound callable
    #[error("tracker has no callable bound")]
    NotBound,

    /// `finish` called with both a result and an error
    #[error("`finish` accepts a result or an error, not both")]
    FinishConflict,

    /// `finish` called on a trial already in a terminal state
    #[error("trial already reached a terminal state")]
    AlreadyFinished,

    /// A snapshot exists but its stored params disagree with the current invocation
    #[error("snapshot params mismatch: stored {stored}, current {current}")]
    SnapshotParamMismatch {
        /// Params recorded in the snapshot, rendered for the message
        stored: String,
        /// Params of the current invocation, rendered for the message
        current: String,
    },

    /// Explicit `snapshot()` called while no iterator-backed run is in progress
    #[error("`snapshot` can be used only from a tracked iterator run")]
    SnapshotUnavailable,

    /// Reading the result of a trial whose record shows a failure
    #[error("trial failed: {error}{}", .traceback.as_deref().map(|t| format!("\n   caused by\n{t}")).unwrap_or_default())]
    TrialFailed {
        /// Stored string form of the original error
        error: String,
        /// Attached traceback text, when retrievable
        traceback: Option<String>,
    },

    /// Recording a metric under a series whose format was already fixed differently
    #[error("series {series:?} already uses format {fixed}, cannot record {requested}")]
    FormatMismatch {
        /// Series name (empty string = default series)
        series: String,
        /// Format fixed by the series' first row
        fixed: String,
        /// Format requested by this call
        requested: String,
    },

    /// Storage scheme has no registered backend
    #[error("no storage backend registered for scheme {scheme:?}")]
    UnknownScheme {
        /// URI scheme
        scheme: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record codec error
    #[error("record codec error: {0}")]
    Codec(#[from] serde_yaml::Error),

    /// Snapshot / metric serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
