//! # tracklet: durable trial tracking for experiments
//!
//! tracklet instruments arbitrary units of work ("trials") and durably
//! records their parameters, lifecycle state, results, errors, ad-hoc
//! metadata, and streamed metrics to a directory per trial. No database to
//! operate: every trial is a plain directory holding one human-readable
//! record, rotated metric files, and free-form attachments.
//!
//! ## Design
//!
//! - One `Tracker` drives one trial's lifecycle state machine
//!   (`started`/`resumed` → `running` → `done`/`fail`) and persists complete
//!   record snapshots at every checkpoint.
//! - The instrumented callable receives its own tracker, so work code can
//!   `inform` fields and `meter` metric rows against the running trial.
//! - Iterator-backed callables resume across process crashes through an
//!   explicit, versioned snapshot with an author-defined cursor.
//! - An `ActiveScope` admits at most one active tracker per logical context.
//! - A `Trial` reads the same directory back after the fact.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tracklet::{FnTrial, Mapping, Session, Value};
//!
//! let session = Session::builder().path("./trials").build()?;
//! let trial = session.run(
//!     "t2",
//!     FnTrial(|p: &Mapping| {
//!         let n = p.get("n").and_then(Value::as_i64).unwrap_or(0);
//!         Ok(Value::from(n * 2))
//!     }),
//!     [("n".into(), 3.into())].into_iter().collect(),
//! )?;
//! assert_eq!(trial.result()?, Some(Value::from(6)));
//! # Ok::<(), tracklet::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod codec;
pub mod context;
pub mod error;
pub mod hook;
pub mod meta;
pub mod metrics;
pub mod record;
pub mod runner;
pub mod storage;
pub mod track;
pub mod tracker;
pub mod trial;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

pub use serde_yaml::{Mapping, Value};

pub use context::{ActiveGuard, ActiveScope};
pub use error::{Error, Result};
pub use hook::{coerce_to_hook, Hook, HookSet, NoopHook};
pub use meta::{capture_meta, MetaProviders};
pub use metrics::{MetricFormat, MetricsExporter};
pub use record::{TrialRecord, TrialState};
pub use runner::{InplaceRunner, Runner, RunnerRegistry};
pub use storage::{AutoCommit, LocalStorage, Storage, StorageRegistry};
pub use track::{TidPattern, TrackOptions};
pub use tracker::{
    FnTrial, InfusedTracker, Outcome, Resumable, Step, Track, TrackedFn, Tracker, TrialFn,
};
pub use trial::Trial;

enum RunnerChoice {
    Name(String),
    Strategy(Box<dyn Runner>),
}

/// Configured composition of storage, hooks, runner, and metadata providers.
///
/// The explicit replacement for ambient global configuration; a process-wide
/// session is available through [`init`] and [`run`] at the outermost layer.
pub struct Session {
    base: String,
    storage: Arc<dyn Storage>,
    hook: Arc<dyn Hook>,
    runner: Box<dyn Runner>,
    meta_providers: MetaProviders,
    scope: Arc<ActiveScope>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start building a session.
    #[must_use]
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Execute one trial synchronously and return its read handle.
    ///
    /// Captures metadata, creates a tracker rooted at `<base>/<tid>`,
    /// activates it in the session's scope, runs the callable, and returns a
    /// [`Trial`] bound to the tracker's directory.
    ///
    /// # Errors
    ///
    /// Propagates activation and protocol errors; a failing callable is
    /// recorded in the returned trial instead.
    pub fn run(
        &self,
        tid: &str,
        func: impl TrialFn + 'static,
        params: Mapping,
    ) -> Result<Trial> {
        let meta = capture_meta(&self.meta_providers);
        let dir = format!("{}/{tid}", self.base);
        let tracker = Tracker::new(
            dir.clone(),
            tid,
            meta,
            Arc::clone(&self.storage),
            Arc::clone(&self.hook),
        );
        self.runner
            .run_with_tracker(&self.scope, tracker, Box::new(func), params)?;
        Ok(Trial::with_storage(dir, Arc::clone(&self.storage)))
    }

    /// Instrumented-call entry point: derive a trial id, run, and read the
    /// result back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrialFailed`] when the callable failed, plus anything
    /// [`Session::run`] returns.
    pub fn track(
        &self,
        options: &TrackOptions,
        func: impl TrialFn + 'static,
        params: Mapping,
    ) -> Result<Option<Value>> {
        let tid = options.derive_tid(&params);
        self.run(&tid, func, params)?.result()
    }
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    path: String,
    hooks: Vec<Arc<dyn Hook>>,
    runner: Option<RunnerChoice>,
    runners: RunnerRegistry,
    storages: StorageRegistry,
    meta_providers: MetaProviders,
    scope: Option<Arc<ActiveScope>>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            path: ".".to_string(),
            hooks: Vec::new(),
            runner: None,
            runners: RunnerRegistry::new(),
            storages: StorageRegistry::new(),
            meta_providers: MetaProviders::new(),
            scope: None,
        }
    }
}

impl SessionBuilder {
    /// Base storage path or URI under which trial directories are created.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Add a lifecycle hook.
    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Select the execution strategy by registered name.
    #[must_use]
    pub fn runner_name(mut self, name: impl Into<String>) -> Self {
        self.runner = Some(RunnerChoice::Name(name.into()));
        self
    }

    /// Use a concrete execution strategy directly. Strategy-specific options
    /// belong to the strategy's own constructor.
    #[must_use]
    pub fn runner(mut self, runner: Box<dyn Runner>) -> Self {
        self.runner = Some(RunnerChoice::Strategy(runner));
        self
    }

    /// Register an additional runner strategy under a name.
    #[must_use]
    pub fn register_runner<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Runner> + Send + Sync + 'static,
    {
        self.runners.register(name, factory);
        self
    }

    /// Register an additional storage backend under a URI scheme.
    #[must_use]
    pub fn register_storage<F>(mut self, scheme: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Storage> + Send + Sync + 'static,
    {
        self.storages.register(scheme, factory);
        self
    }

    /// Add a metadata provider under a dotted key.
    #[must_use]
    pub fn meta_provider<F>(mut self, key: impl Into<String>, provider: F) -> Self
    where
        F: Fn() -> anyhow::Result<Option<String>> + Send + Sync + 'static,
    {
        self.meta_providers.insert(key, provider);
        self
    }

    /// Use an explicit activation scope instead of the process-wide one.
    #[must_use]
    pub fn scope(mut self, scope: Arc<ActiveScope>) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Build the session.
    ///
    /// # Errors
    ///
    /// Fails when the base URI's scheme or the selected runner name cannot be
    /// resolved.
    pub fn build(self) -> Result<Session> {
        let (storage, base) = self.storages.resolve(&self.path)?;
        let runner = match self.runner {
            None => self.runners.resolve("inplace")?,
            Some(RunnerChoice::Name(name)) => self.runners.resolve(&name)?,
            Some(RunnerChoice::Strategy(runner)) => runner,
        };
        debug!(base = %base, "create session");
        Ok(Session {
            base,
            storage,
            hook: coerce_to_hook(self.hooks),
            runner,
            meta_providers: self.meta_providers,
            scope: self.scope.unwrap_or_else(ActiveScope::global),
        })
    }
}

static GLOBAL_SESSION: Mutex<Option<Arc<Session>>> = Mutex::new(None);

/// Configure the process-wide session used by [`run`].
///
/// # Errors
///
/// Propagates [`SessionBuilder::build`] errors.
pub fn init(builder: SessionBuilder) -> Result<()> {
    let session = Arc::new(builder.build()?);
    *GLOBAL_SESSION
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(session);
    Ok(())
}

/// Execute one trial through the process-wide session.
///
/// # Errors
///
/// Returns [`Error::RunnerNotInitialized`] before [`init`], plus anything
/// [`Session::run`] returns.
pub fn run(tid: &str, func: impl TrialFn + 'static, params: Mapping) -> Result<Trial> {
    let session = GLOBAL_SESSION
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(Error::RunnerNotInitialized)?;
    session.run(tid, func, params)
}
