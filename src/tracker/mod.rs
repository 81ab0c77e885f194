//! Tracker: the write side of a trial
//!
//! A [`Tracker`] owns one trial directory, its record, its metrics exporter
//! and its hook dispatcher, and drives the lifecycle state machine:
//! `created → started` (fresh) or `created → resumed` (snapshot loaded), then
//! `running`, then `done` or `fail`. Failures raised by the instrumented
//! callable are recorded, never re-raised to the caller of [`Tracker::run`].
//! The callable receives its own tracker through the [`Track`] interface, so
//! work code can `inform`, `meter`, and attach files against the running
//! trial.
//!
//! Iterator-backed callables checkpoint through an explicit, versioned
//! snapshot: each null item the sequence produces persists the tracker's
//! state (record, info, resume cursor, metrics sequence) before the sequence
//! is advanced again, and a later run against the same directory with equal
//! params continues from the recovered cursor instead of re-invoking the
//! callable from scratch.

mod infused;

pub use infused::InfusedTracker;

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec;
use crate::error::{Error, Result};
use crate::hook::Hook;
use crate::metrics::{ExporterState, MetricFormat, MetricsExporter};
use crate::record::{TrialRecord, TrialState, RECORD_FILE};
use crate::storage::{self, AutoCommit, Storage, WriteHandle};

/// File name of the resume snapshot inside a trial directory.
pub const SNAPSHOT_FILE: &str = "snapshot.yaml";

/// File name of the failure traceback attachment.
pub const TRACEBACK_FILE: &str = "traceback.txt";

const SNAPSHOT_VERSION: u32 = 1;

/// One step of a resumable sequence.
#[derive(Debug)]
pub enum Step {
    /// A null item: checkpoint here, then keep going.
    Checkpoint,
    /// The first non-null item: the run's result.
    Finish(Value),
    /// The sequence is exhausted without a result.
    End,
}

/// A lazy sequence of work with an author-defined resume token.
///
/// The suspended position is represented by the [`Resumable::cursor`] value
/// the author serializes deliberately; opaque closure state is never
/// persisted.
pub trait Resumable {
    /// Advance the sequence by one item.
    ///
    /// The live tracker is passed in so a step can `inform` and `meter`
    /// against the trial it runs under.
    ///
    /// # Errors
    ///
    /// A step error fails the whole trial.
    fn step(&mut self, tracker: &mut dyn Track) -> anyhow::Result<Step>;

    /// The serializable resume token for the current position.
    fn cursor(&self) -> Value;
}

/// What a callable invocation produced.
pub enum Outcome {
    /// A final value.
    Value(Value),
    /// A lazy sequence to drive with checkpointing.
    Steps(Box<dyn Resumable>),
}

/// An instrumented unit of work.
pub trait TrialFn {
    /// Invoke the work with the bound params.
    ///
    /// The live tracker is passed in so the work can `inform`, `meter`, and
    /// attach files against its own trial while it runs.
    ///
    /// # Errors
    ///
    /// Errors are captured into the trial record as a failure.
    fn call(&mut self, tracker: &mut dyn Track, params: &Mapping) -> anyhow::Result<Outcome>;

    /// Rebuild the lazy sequence from a snapshot cursor.
    ///
    /// The default marks the callable as non-resumable, which downgrades a
    /// found snapshot to a fresh start.
    ///
    /// # Errors
    ///
    /// Returns an error when the cursor cannot be honored.
    fn restore(&mut self, params: &Mapping, cursor: Value) -> anyhow::Result<Box<dyn Resumable>> {
        let _ = (params, cursor);
        Err(anyhow::anyhow!("callable does not support resuming"))
    }
}

/// Adapter turning a plain closure into a [`TrialFn`].
pub struct FnTrial<F>(pub F);

impl<F> TrialFn for FnTrial<F>
where
    F: FnMut(&Mapping) -> anyhow::Result<Value>,
{
    fn call(&mut self, _tracker: &mut dyn Track, params: &Mapping) -> anyhow::Result<Outcome> {
        (self.0)(params).map(Outcome::Value)
    }
}

/// Adapter turning a closure that needs the live tracker into a [`TrialFn`].
pub struct TrackedFn<F>(pub F);

impl<F> TrialFn for TrackedFn<F>
where
    F: FnMut(&mut dyn Track, &Mapping) -> anyhow::Result<Value>,
{
    fn call(&mut self, tracker: &mut dyn Track, params: &Mapping) -> anyhow::Result<Outcome> {
        (self.0)(tracker, params).map(Outcome::Value)
    }
}

/// Interface shared by full and infused trackers, as consumed by hooks and
/// the active-tracker context.
pub trait Track {
    /// Process-unique tracker identifier.
    fn uid(&self) -> &str;

    /// Trial identifier.
    fn tid(&self) -> &str;

    /// Trial directory.
    fn dir(&self) -> &str;

    /// Merge free-form fields into the tracker's info.
    ///
    /// # Errors
    ///
    /// Infused trackers persist on every call and can fail on IO.
    fn inform(&mut self, fields: Mapping) -> Result<()>;

    /// Record one metric row.
    ///
    /// # Errors
    ///
    /// Fails on a format mismatch for the series or on rotation IO.
    fn meter(
        &mut self,
        values: BTreeMap<String, serde_json::Value>,
        series: Option<&str>,
        format: Option<MetricFormat>,
    ) -> Result<()>;

    /// Flush record and metrics.
    ///
    /// # Errors
    ///
    /// Fails on codec or storage errors.
    fn flush(&mut self) -> Result<()>;

    /// Called once when the tracker becomes the scope's active tracker.
    fn activate(&mut self);

    /// Open a named attachment in the trial directory for writing.
    ///
    /// # Errors
    ///
    /// Fails when the attachment cannot be created.
    fn attach(&self, name: &str) -> Result<Box<dyn WriteHandle>>;
}

/// Versioned on-disk resume state.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    uid: String,
    tid: String,
    params: Mapping,
    record: Option<TrialRecord>,
    info: Mapping,
    cursor: Value,
    metrics: ExporterState,
}

/// Write-side tracker for one trial.
pub struct Tracker {
    dir: String,
    storage: Arc<dyn Storage>,
    hook: Arc<dyn Hook>,
    metrics: MetricsExporter,
    uid: String,
    tid: String,
    meta: Mapping,
    info: Mapping,
    record: Option<TrialRecord>,
    func: Option<Box<dyn TrialFn>>,
    params: Option<Mapping>,
    iter: Option<Box<dyn Resumable>>,
}

impl Tracker {
    /// Create a tracker rooted at a trial directory.
    ///
    /// Assigns a fresh time-ordered `uid`; nothing is written until the first
    /// flush checkpoint.
    #[must_use]
    pub fn new(
        dir: impl Into<String>,
        tid: impl Into<String>,
        meta: Mapping,
        storage: Arc<dyn Storage>,
        hook: Arc<dyn Hook>,
    ) -> Self {
        let dir = dir.into();
        let metrics = MetricsExporter::new(Arc::clone(&storage), dir.clone());
        Self {
            dir,
            storage,
            hook,
            metrics,
            uid: Uuid::now_v7().simple().to_string(),
            tid: tid.into(),
            meta,
            info: Mapping::new(),
            record: None,
            func: None,
            params: None,
            iter: None,
        }
    }

    /// The tracker's current record, if the trial has started.
    #[must_use]
    pub fn record(&self) -> Option<&TrialRecord> {
        self.record.as_ref()
    }

    /// Attach the callable and its params.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyBound`] when a callable is already attached.
    pub fn bind(&mut self, func: Box<dyn TrialFn>, params: Mapping) -> Result<()> {
        if self.func.is_some() {
            return Err(Error::AlreadyBound);
        }
        debug!(uid = %self.uid, "bind tracker");
        self.func = Some(func);
        self.params = Some(params);
        Ok(())
    }

    /// Bind and run in one step.
    ///
    /// # Errors
    ///
    /// Same as [`Tracker::bind`] followed by [`Tracker::run`].
    pub fn run_with(&mut self, func: Box<dyn TrialFn>, params: Mapping) -> Result<()> {
        self.bind(func, params)?;
        self.run()
    }

    /// Execute the bound callable under the lifecycle state machine.
    ///
    /// A failing callable is recorded as `fail` and not re-raised; only
    /// configuration and protocol errors (no callable bound, snapshot params
    /// mismatch, storage failures while persisting the initial record)
    /// propagate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotBound`] without a callable, or
    /// [`Error::SnapshotParamMismatch`] when a snapshot disagrees with the
    /// current params.
    pub fn run(&mut self) -> Result<()> {
        if self.func.is_none() {
            return Err(Error::NotBound);
        }
        let params = self.params.clone().unwrap_or_default();

        if self.load_snapshot()? {
            if let Some(record) = self.record.as_mut() {
                record.state = TrialState::Resumed;
                record.at.mark_resumed();
            }
            self.flush_inner(false)?;
        } else {
            self.start(&params)?;
        }

        if let Some(record) = self.record.as_mut() {
            record.state = TrialState::Running;
            record.at.mark_started();
        }
        self.flush_inner(false)?;

        match self.invoke(&params) {
            Ok(result) => self.finish(Some(result), None),
            Err(e) => self.finish(None, Some(e)),
        }
    }

    /// Enter a terminal state with at most one of `result` / `error`.
    ///
    /// Stamps the finished time, fires the finish hook, and flushes record
    /// and metrics. Failures write a [`TRACEBACK_FILE`] attachment with the
    /// full error chain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FinishConflict`] when both a result and an error are
    /// given, [`Error::AlreadyFinished`] when the trial is already terminal,
    /// or a storage error when the terminal record cannot be persisted.
    pub fn finish(&mut self, result: Option<Value>, error: Option<anyhow::Error>) -> Result<()> {
        if result.is_some() && error.is_some() {
            return Err(Error::FinishConflict);
        }
        if self.record.as_ref().is_some_and(|r| r.state.is_terminal()) {
            return Err(Error::AlreadyFinished);
        }
        // Terminal: the resume window is over.
        self.iter = None;
        if self.record.is_none() {
            self.record = Some(TrialRecord::new(
                self.tid.clone(),
                self.uid.clone(),
                self.meta.clone(),
                &Mapping::new(),
            ));
        }
        // {:?} renders the cause chain (and backtrace when captured).
        let traceback = error.as_ref().map(|e| format!("{e:?}\n"));
        if let Some(record) = self.record.as_mut() {
            match error {
                Some(e) => record.finish_fail(e.to_string()),
                None => record.finish_done(result.unwrap_or(Value::Null)),
            }
            record.at.mark_finished();
        }
        if let Some(text) = traceback {
            storage::write_all(
                &*self.storage,
                &format!("{}/{TRACEBACK_FILE}", self.dir),
                text.as_bytes(),
            )?;
        }

        let hook = Arc::clone(&self.hook);
        hook.on_tracker_finish(self);
        self.flush_inner(true)
    }

    /// Merge fields into `info`, warning when an existing key changes value.
    ///
    /// Usable at any lifecycle point, including before the trial starts.
    pub fn inform(&mut self, fields: Mapping) {
        for (k, v) in fields {
            if let Some(old) = self.info.get(&k) {
                if *old != v {
                    warn!("overwrite informed field {k:?}: {old:?} -> {v:?}");
                }
            }
            self.info.insert(k, v);
        }
    }

    /// Explicit, user-triggered checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SnapshotUnavailable`] unless an iterator-backed run
    /// is in progress.
    pub fn snapshot(&mut self) -> Result<()> {
        if self.iter.is_none() {
            return Err(Error::SnapshotUnavailable);
        }
        self.dump_snapshot()
    }

    /// Persist the record (and optionally drain the metrics exporter).
    ///
    /// The flush hook fires first, so hooks can still mutate `info` before
    /// the write. Before the trial has started there is no record to write;
    /// the hook still fires and metrics still drain.
    ///
    /// # Errors
    ///
    /// Fails on codec or storage errors.
    pub fn flush(&mut self, include_metrics: bool) -> Result<()> {
        self.flush_inner(include_metrics)
    }

    /// Create a lightweight secondary tracker sharing this trial's directory.
    #[must_use]
    pub fn infused(&self) -> InfusedTracker {
        InfusedTracker::new(
            self.dir.clone(),
            self.tid.clone(),
            Arc::clone(&self.storage),
            Arc::clone(&self.hook),
        )
    }

    fn start(&mut self, params: &Mapping) -> Result<()> {
        let mut record = TrialRecord::new(self.tid.clone(), self.uid.clone(), self.meta.clone(), params);
        record.info = self.info.clone();
        self.record = Some(record);

        let hook = Arc::clone(&self.hook);
        hook.on_tracker_start(self);
        self.flush_inner(false)
    }

    fn invoke(&mut self, params: &Mapping) -> anyhow::Result<Value> {
        if self.iter.is_none() {
            // Taken out for the call so the callable can borrow the tracker.
            let mut func = self.func.take().ok_or(Error::NotBound)?;
            let outcome = func.call(self, params);
            self.func = Some(func);
            match outcome? {
                Outcome::Value(v) => return Ok(v),
                Outcome::Steps(iter) => self.iter = Some(iter),
            }
        }

        loop {
            let Some(mut iter) = self.iter.take() else {
                return Ok(Value::Null);
            };
            let step = iter.step(self);
            self.iter = Some(iter);
            match step? {
                Step::Checkpoint => self.dump_snapshot()?,
                Step::Finish(v) => return Ok(v),
                Step::End => return Ok(Value::Null),
            }
        }
    }

    fn dump_snapshot(&mut self) -> Result<()> {
        self.flush_inner(true)?;
        debug!(uid = %self.uid, "dump snapshot");
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            uid: self.uid.clone(),
            tid: self.tid.clone(),
            params: self.params.clone().unwrap_or_default(),
            record: self.record.clone(),
            info: self.info.clone(),
            cursor: self.iter.as_ref().map_or(Value::Null, |i| i.cursor()),
            metrics: self.metrics.state(),
        };
        let text = serde_yaml::to_string(&snapshot)?;
        storage::write_all(
            &*self.storage,
            &format!("{}/{SNAPSHOT_FILE}", self.dir),
            text.as_bytes(),
        )
    }

    /// Restore tracker state from a persisted snapshot, keeping the current
    /// directory and hook dispatcher.
    ///
    /// Missing or unreadable snapshots downgrade to a fresh start; a params
    /// mismatch is a fatal configuration error.
    fn load_snapshot(&mut self) -> Result<bool> {
        let path = format!("{}/{SNAPSHOT_FILE}", self.dir);
        if !self.storage.exists(&path) {
            debug!("snapshot not found");
            return Ok(false);
        }
        let snapshot: Snapshot = match self
            .storage
            .open_read(&path)
            .and_then(|r| serde_yaml::from_reader(r).map_err(Error::from))
        {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to load snapshot: {e}");
                return Ok(false);
            }
        };
        if snapshot.version != SNAPSHOT_VERSION {
            warn!(version = snapshot.version, "unsupported snapshot version");
            return Ok(false);
        }

        let current = self.params.clone().unwrap_or_default();
        if snapshot.params != current {
            return Err(Error::SnapshotParamMismatch {
                stored: serde_yaml::to_string(&snapshot.params).unwrap_or_default().trim().to_string(),
                current: serde_yaml::to_string(&current).unwrap_or_default().trim().to_string(),
            });
        }

        let iter = if snapshot.cursor.is_null() {
            None
        } else {
            let Some(func) = self.func.as_mut() else {
                return Ok(false);
            };
            match func.restore(&current, snapshot.cursor.clone()) {
                Ok(iter) => Some(iter),
                Err(e) => {
                    warn!("callable cannot resume from snapshot: {e}");
                    return Ok(false);
                }
            }
        };

        debug!(uid = %snapshot.uid, "resume from snapshot");
        self.uid = snapshot.uid;
        self.tid = snapshot.tid;
        self.record = snapshot.record;
        self.info = snapshot.info;
        self.metrics.restore(snapshot.metrics);
        self.iter = iter;
        Ok(true)
    }

    fn flush_inner(&mut self, include_metrics: bool) -> Result<()> {
        debug!(uid = %self.uid, "flush tracker");
        let hook = Arc::clone(&self.hook);
        hook.on_tracker_flush(self);
        if let Some(record) = self.record.as_mut() {
            record.info = self.info.clone();
        }
        if let Some(record) = &self.record {
            let text = codec::encode_record(record)?;
            storage::write_all(
                &*self.storage,
                &format!("{}/{RECORD_FILE}", self.dir),
                text.as_bytes(),
            )?;
        }
        if include_metrics {
            self.metrics.flush()?;
        }
        Ok(())
    }
}

impl Track for Tracker {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn tid(&self) -> &str {
        &self.tid
    }

    fn dir(&self) -> &str {
        &self.dir
    }

    fn inform(&mut self, fields: Mapping) -> Result<()> {
        Self::inform(self, fields);
        Ok(())
    }

    fn meter(
        &mut self,
        values: BTreeMap<String, serde_json::Value>,
        series: Option<&str>,
        format: Option<MetricFormat>,
    ) -> Result<()> {
        self.metrics.record(values, series.unwrap_or(""), format)
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_inner(true)
    }

    fn activate(&mut self) {}

    fn attach(&self, name: &str) -> Result<Box<dyn WriteHandle>> {
        let path = format!("{}/{name}", self.dir);
        debug!(name, path = %path, "open attachment");
        self.storage.open_write(&path, AutoCommit::OnClose)
    }
}

/// Open an attachment of a trial directory for reading.
pub(crate) fn open_attachment(
    storage: &dyn Storage,
    dir: &str,
    name: &str,
) -> Result<Box<dyn Read>> {
    storage.open_read(&format!("{dir}/{name}"))
}
