//! Instrumentation entry point: trial-id derivation
//!
//! Wrapping a callable derives a trial id from a pattern (a timestamp by
//! default), optionally prefixed with a name and suffixed with a random
//! unique slug so repeated invocations with identical inputs never collide.

use chrono::Utc;
use serde_yaml::Mapping;
use uuid::Uuid;

/// Default timestamp pattern for derived trial ids.
const DEFAULT_TID_FORMAT: &str = "%y-%m-%d/%H:%M:%S";

/// How the trial id body is derived from an invocation.
pub enum TidPattern {
    /// Current timestamp, `yy-mm-dd/HH:MM:SS`.
    Timestamp,
    /// A fixed string.
    Literal(String),
    /// A custom function of the call params.
    Custom(Box<dyn Fn(&Mapping) -> String + Send + Sync>),
}

/// Options for deriving trial ids at the instrumentation entry point.
pub struct TrackOptions {
    name: Option<String>,
    pattern: TidPattern,
    rand_slug: bool,
}

impl Default for TrackOptions {
    fn default() -> Self {
        Self {
            name: None,
            pattern: TidPattern::Timestamp,
            rand_slug: true,
        }
    }
}

impl TrackOptions {
    /// Options with the default timestamp pattern and a random suffix.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix derived ids with `<name>/`.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replace the id pattern.
    #[must_use]
    pub fn pattern(mut self, pattern: TidPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Enable or disable the random unique suffix.
    #[must_use]
    pub const fn rand_slug(mut self, on: bool) -> Self {
        self.rand_slug = on;
        self
    }

    /// Derive a trial id for one invocation.
    #[must_use]
    pub fn derive_tid(&self, params: &Mapping) -> String {
        let prefix = self
            .name
            .as_deref()
            .map(|n| format!("{n}/"))
            .unwrap_or_default();
        let body = match &self.pattern {
            TidPattern::Timestamp => Utc::now().format(DEFAULT_TID_FORMAT).to_string(),
            TidPattern::Literal(s) => s.clone(),
            TidPattern::Custom(f) => f(params),
        };
        let suffix = if self.rand_slug {
            format!("/{}", Uuid::now_v7().simple())
        } else {
            String::new()
        };
        format!("{prefix}{body}{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use serde_yaml::Value;

    use super::*;

    #[test]
    fn test_default_pattern_is_timestamped() {
        let tid = TrackOptions::new().rand_slug(false).derive_tid(&Mapping::new());
        // yy-mm-dd/HH:MM:SS
        assert_eq!(tid.len(), "00-00-00/00:00:00".len());
        assert!(tid.contains('/'));
    }

    #[test]
    fn test_name_prefix_and_literal() {
        let tid = TrackOptions::new()
            .name("train")
            .pattern(TidPattern::Literal("baseline".to_string()))
            .rand_slug(false)
            .derive_tid(&Mapping::new());
        assert_eq!(tid, "train/baseline");
    }

    #[test]
    fn test_custom_pattern_sees_params() {
        let opts = TrackOptions::new()
            .pattern(TidPattern::Custom(Box::new(|p: &Mapping| {
                format!("n={}", p.get("n").and_then(Value::as_i64).unwrap_or(0))
            })))
            .rand_slug(false);
        let params: Mapping = [(Value::from("n"), Value::from(3))].into_iter().collect();
        assert_eq!(opts.derive_tid(&params), "n=3");
    }

    #[test]
    fn test_rand_slug_differs_per_call() {
        let opts = TrackOptions::new().pattern(TidPattern::Literal("x".to_string()));
        let a = opts.derive_tid(&Mapping::new());
        let b = opts.derive_tid(&Mapping::new());
        assert_ne!(a, b);
        assert!(a.starts_with("x/"));
    }
}
