//! Runners: execution strategies and their registry
//!
//! A runner binds an instrumented callable to a tracker and executes it under
//! the active-tracker discipline. Strategies are selected by string name
//! through an explicit [`RunnerRegistry`]; exactly one registration may claim
//! a name at resolution time.

use serde_yaml::Mapping;
use tracing::info;

use crate::context::ActiveScope;
use crate::error::{Error, Result};
use crate::tracker::{Tracker, TrialFn};

/// An execution strategy for one trial.
///
/// Implementations must satisfy the tracker protocol and the
/// one-active-tracker-per-scope rule; the built-in strategy runs the callable
/// synchronously on the caller's thread.
pub trait Runner: Send + Sync {
    /// Activate the tracker in the scope and drive it to completion.
    ///
    /// # Errors
    ///
    /// Propagates activation and protocol errors; callable failures are
    /// recorded in the trial, not returned.
    fn run_with_tracker(
        &self,
        scope: &ActiveScope,
        tracker: Tracker,
        func: Box<dyn TrialFn>,
        params: Mapping,
    ) -> Result<()>;
}

/// Synchronous in-process execution on the caller's thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InplaceRunner;

impl std::fmt::Debug for dyn Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Runner")
    }
}

impl Runner for InplaceRunner {
    fn run_with_tracker(
        &self,
        scope: &ActiveScope,
        tracker: Tracker,
        func: Box<dyn TrialFn>,
        params: Mapping,
    ) -> Result<()> {
        let mut guard = scope.enter(tracker)?;
        guard.bind(func, params)?;
        guard.run()
        // Guard drop flushes once more and releases the scope.
    }
}

/// Constructor for a runner strategy.
pub type RunnerFactory = Box<dyn Fn() -> Box<dyn Runner> + Send + Sync>;

/// Name-to-strategy registry.
///
/// Registrations are kept in order; duplicates are detected at resolution,
/// not insertion, so a misconfigured double claim surfaces as
/// [`Error::AmbiguousRunner`].
pub struct RunnerRegistry {
    entries: Vec<(String, RunnerFactory)>,
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        let mut reg = Self {
            entries: Vec::new(),
        };
        reg.register("inplace", || Box::new(InplaceRunner));
        reg
    }
}

impl RunnerRegistry {
    /// Create a registry with the built-in `inplace` strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy under a name.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Runner> + Send + Sync + 'static,
    {
        self.entries.push((name.into(), Box::new(factory)));
    }

    /// Registered names, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Resolve a strategy by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRunner`] for zero matches and
    /// [`Error::AmbiguousRunner`] for more than one.
    pub fn resolve(&self, name: &str) -> Result<Box<dyn Runner>> {
        info!(
            "found {} runners: {}",
            self.entries.len(),
            self.names().join(", ")
        );
        let matches: Vec<&RunnerFactory> = self
            .entries
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, f)| f)
            .collect();
        match matches.as_slice() {
            [] => Err(Error::UnknownRunner {
                name: name.to_string(),
            }),
            [factory] => Ok(factory()),
            many => Err(Error::AmbiguousRunner {
                name: name.to_string(),
                count: many.len(),
            }),
        }
    }
}
