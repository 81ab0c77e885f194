//! Metadata providers: captured environment facts for trial records
//!
//! A provider is a zero-argument function keyed by a dotted name
//! (e.g. `git.commit`) returning a string. Providers that have nothing to say
//! return `Ok(None)` and are skipped silently; failing providers are logged
//! and skipped. Dotted keys expand into nested mappings and merge
//! recursively, last provider wins per key.

use serde_yaml::{Mapping, Value};
use tracing::{info, warn};

/// A pluggable metadata source.
pub type MetaProvider = Box<dyn Fn() -> anyhow::Result<Option<String>> + Send + Sync>;

/// Ordered set of metadata providers, keyed by dotted names.
#[derive(Default)]
pub struct MetaProviders {
    entries: Vec<(String, MetaProvider)>,
}

impl MetaProviders {
    /// Create an empty provider set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider under a dotted key. Later providers win on conflict.
    pub fn insert<F>(&mut self, key: impl Into<String>, provider: F)
    where
        F: Fn() -> anyhow::Result<Option<String>> + Send + Sync + 'static,
    {
        self.entries.push((key.into(), Box::new(provider)));
    }

    /// Whether no providers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Invoke every provider and merge the results into one nested mapping.
#[must_use]
pub fn capture_meta(providers: &MetaProviders) -> Mapping {
    let mut meta = Mapping::new();
    for (key, provider) in &providers.entries {
        info!("capture metadata {key:?}");
        let value = match provider() {
            Ok(Some(v)) => v,
            Ok(None) => continue,
            Err(e) => {
                warn!("failed to capture {key:?}: {e}");
                continue;
            }
        };
        meta = merge_mappings(meta, expand_dotted(key, value));
    }
    meta
}

/// Expand a dotted key into a nested single-entry mapping.
fn expand_dotted(key: &str, value: String) -> Mapping {
    let mut sections = key.split('.').rev();
    let leaf = sections.next().unwrap_or(key);
    let mut inner = Mapping::new();
    inner.insert(Value::from(leaf), Value::from(value));
    for section in sections {
        let mut outer = Mapping::new();
        outer.insert(Value::from(section), Value::Mapping(inner));
        inner = outer;
    }
    inner
}

/// Merge two values: mappings merge per key recursively, anything else is
/// replaced by the right-hand side.
#[must_use]
pub fn merge_values(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Mapping(a), Value::Mapping(b)) => Value::Mapping(merge_mappings(a, b)),
        (_, b) => b,
    }
}

/// Merge two mappings recursively, `b` winning per key.
#[must_use]
pub fn merge_mappings(a: Mapping, b: Mapping) -> Mapping {
    let mut out = a;
    for (k, vb) in b {
        let merged = match out.remove(&k) {
            Some(va) => merge_values(va, vb),
            None => vb,
        };
        out.insert(k, merged);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dotted_keys_expand_and_merge() {
        let mut providers = MetaProviders::new();
        providers.insert("git.commit", || Ok(Some("abc123".to_string())));
        providers.insert("git.branch", || Ok(Some("main".to_string())));
        providers.insert("host", || Ok(Some("worker-1".to_string())));

        let meta = capture_meta(&providers);
        let git = meta.get("git").unwrap().as_mapping().unwrap();
        assert_eq!(git.get("commit"), Some(&Value::from("abc123")));
        assert_eq!(git.get("branch"), Some(&Value::from("main")));
        assert_eq!(meta.get("host"), Some(&Value::from("worker-1")));
    }

    #[test]
    fn test_no_metadata_and_failures_are_skipped() {
        let mut providers = MetaProviders::new();
        providers.insert("absent", || Ok(None));
        providers.insert("broken", || Err(anyhow::anyhow!("no repo")));
        providers.insert("ok", || Ok(Some("x".to_string())));

        let meta = capture_meta(&providers);
        assert_eq!(meta.len(), 1);
        assert_eq!(meta.get("ok"), Some(&Value::from("x")));
    }

    #[test]
    fn test_last_provider_wins_recursively() {
        let mut providers = MetaProviders::new();
        providers.insert("env.user", || Ok(Some("alice".to_string())));
        providers.insert("env.user", || Ok(Some("bob".to_string())));

        let meta = capture_meta(&providers);
        let env = meta.get("env").unwrap().as_mapping().unwrap();
        assert_eq!(env.get("user"), Some(&Value::from("bob")));
    }

    #[test]
    fn test_conflicting_types_replaced_by_later() {
        let mut a = Mapping::new();
        a.insert(Value::from("k"), Value::from("scalar"));
        let mut inner = Mapping::new();
        inner.insert(Value::from("x"), Value::from(1));
        let mut b = Mapping::new();
        b.insert(Value::from("k"), Value::Mapping(inner.clone()));

        let merged = merge_mappings(a, b);
        assert_eq!(merged.get("k"), Some(&Value::Mapping(inner)));
    }
}
