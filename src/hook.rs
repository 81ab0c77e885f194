//! Lifecycle hooks: observer fan-out for tracker events
//!
//! Observers implement [`Hook`] with no-op defaults and receive the tracker
//! through the [`Track`] interface, so they can `inform` or meter against it
//! before a flush hits storage. A [`HookSet`] fans each event out to every
//! registered observer in registration order; the dispatcher itself does not
//! contain observer panics.

use std::sync::Arc;

use crate::tracker::Track;

/// Observer of tracker lifecycle events. All methods default to no-ops.
#[allow(unused_variables)]
pub trait Hook: Send + Sync {
    /// A tracker built its fresh record and is about to persist it.
    fn on_tracker_start(&self, tracker: &mut dyn Track) {}

    /// A tracker is about to write its record; mutations made here are
    /// included in the write.
    fn on_tracker_flush(&self, tracker: &mut dyn Track) {}

    /// A tracker reached a terminal state.
    fn on_tracker_finish(&self, tracker: &mut dyn Track) {}

    /// A secondary (infused) tracker was activated inside a trial.
    fn on_tracker_infused(&self, tracker: &mut dyn Track) {}
}

/// Hook that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl Hook for NoopHook {}

/// Fans each event out to every registered hook, in registration order.
pub struct HookSet {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookSet {
    /// Create a fan-out over the given hooks.
    #[must_use]
    pub fn new(hooks: Vec<Arc<dyn Hook>>) -> Self {
        Self { hooks }
    }
}

impl Hook for HookSet {
    fn on_tracker_start(&self, tracker: &mut dyn Track) {
        for h in &self.hooks {
            h.on_tracker_start(tracker);
        }
    }

    fn on_tracker_flush(&self, tracker: &mut dyn Track) {
        for h in &self.hooks {
            h.on_tracker_flush(tracker);
        }
    }

    fn on_tracker_finish(&self, tracker: &mut dyn Track) {
        for h in &self.hooks {
            h.on_tracker_finish(tracker);
        }
    }

    fn on_tracker_infused(&self, tracker: &mut dyn Track) {
        for h in &self.hooks {
            h.on_tracker_infused(tracker);
        }
    }
}

/// Normalize zero, one, or many hooks into one dispatcher-shaped value.
#[must_use]
pub fn coerce_to_hook(mut hooks: Vec<Arc<dyn Hook>>) -> Arc<dyn Hook> {
    match hooks.len() {
        0 => Arc::new(NoopHook),
        1 => hooks.remove(0),
        _ => Arc::new(HookSet::new(hooks)),
    }
}
