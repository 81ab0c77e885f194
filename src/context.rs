//! Active-tracker context: at most one active tracker per scope
//!
//! An [`ActiveScope`] is an explicit, injectable scope token. Activating a
//! tracker while another is active in the same scope signals nested or
//! concurrent misuse and fails before any callable executes. The guard
//! returned by [`ActiveScope::enter`] flushes the tracker exactly once on
//! exit, success or failure, with flush problems logged but never re-raised
//! so teardown cannot mask the instrumented call's real outcome.

use std::ops::{Deref, DerefMut};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::tracker::Track;

/// One logical execution context that admits at most one active tracker.
#[derive(Debug, Default)]
pub struct ActiveScope {
    active: AtomicBool,
}

impl ActiveScope {
    /// Create a fresh, empty scope.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
        }
    }

    /// The single process-wide scope, used by the outermost composition layer.
    #[must_use]
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ActiveScope>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Activate a tracker in this scope.
    ///
    /// The check-and-set is atomic: a racing second activation is rejected,
    /// never queued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateActiveTracker`] when a tracker is already
    /// active in this scope.
    pub fn enter<T: Track>(&self, tracker: T) -> Result<ActiveGuard<'_, T>> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::DuplicateActiveTracker);
        }
        debug!(uid = tracker.uid(), "enter tracker");
        let mut guard = ActiveGuard {
            scope: self,
            tracker,
        };
        guard.tracker.activate();
        Ok(guard)
    }

    /// Whether a tracker is currently active in this scope.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Exclusive handle to the scope's active tracker.
///
/// Dereferences to the tracker. Dropping the guard flushes the tracker and
/// clears the scope's active slot.
pub struct ActiveGuard<'a, T: Track> {
    scope: &'a ActiveScope,
    tracker: T,
}

impl<T: Track> std::fmt::Debug for ActiveGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveGuard").finish_non_exhaustive()
    }
}

impl<T: Track> Deref for ActiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.tracker
    }
}

impl<T: Track> DerefMut for ActiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.tracker
    }
}

impl<T: Track> Drop for ActiveGuard<'_, T> {
    fn drop(&mut self) {
        debug!(uid = self.tracker.uid(), "exit tracker");
        // Bound hook and storage failures here so teardown never masks the
        // instrumented call's outcome.
        match catch_unwind(AssertUnwindSafe(|| self.tracker.flush())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("unable to flush tracker: {e}"),
            Err(_) => error!("tracker flush panicked during teardown"),
        }
        self.scope.active.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::tests::test_tracker;

    #[test]
    fn test_second_activation_rejected() {
        let scope = ActiveScope::new();
        let _guard = scope.enter(test_tracker()).unwrap();
        let err = scope.enter(test_tracker()).unwrap_err();
        assert!(matches!(err, Error::DuplicateActiveTracker));
    }

    #[test]
    fn test_slot_cleared_on_drop() {
        let scope = ActiveScope::new();
        {
            let _guard = scope.enter(test_tracker()).unwrap();
            assert!(scope.is_active());
        }
        assert!(!scope.is_active());
        let _guard = scope.enter(test_tracker()).unwrap();
    }
}
