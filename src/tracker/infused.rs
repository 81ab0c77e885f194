//! Infused tracker: lightweight secondary instrumentation inside a trial
//!
//! Shares a trial directory and `tid` with the primary tracker but owns its
//! own `uid`, so nested or auxiliary instrumentation never overwrites the
//! primary record: its info lands in a private `info-<uid>.yaml` file and its
//! metric files carry the uid as a suffix. There are no lifecycle states
//! beyond active.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_yaml::Mapping;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::hook::Hook;
use crate::metrics::{MetricFormat, MetricsExporter};
use crate::storage::{self, AutoCommit, Storage, WriteHandle};
use crate::tracker::Track;

#[derive(Serialize)]
struct InfoFile<'a> {
    at: DateTime<Utc>,
    info: &'a Mapping,
}

/// Secondary tracker bound to an existing trial directory.
pub struct InfusedTracker {
    dir: String,
    storage: Arc<dyn Storage>,
    hook: Arc<dyn Hook>,
    metrics: MetricsExporter,
    uid: String,
    tid: String,
    info: Mapping,
    info_file: String,
}

impl InfusedTracker {
    pub(crate) fn new(
        dir: String,
        tid: String,
        storage: Arc<dyn Storage>,
        hook: Arc<dyn Hook>,
    ) -> Self {
        let uid = Uuid::now_v7().simple().to_string();
        let metrics = MetricsExporter::new(Arc::clone(&storage), dir.clone()).with_uid_suffix(&uid);
        Self {
            dir,
            storage,
            hook,
            metrics,
            info_file: format!("info-{uid}.yaml"),
            uid,
            tid,
            info: Mapping::new(),
        }
    }

    /// Name of this tracker's private info file inside the trial directory.
    #[must_use]
    pub fn info_file(&self) -> &str {
        &self.info_file
    }

    /// Merge fields into the private info and persist it immediately.
    ///
    /// Unlike the primary tracker, every call writes the info file; there is
    /// no batching.
    ///
    /// # Errors
    ///
    /// Fails when the info file cannot be written.
    pub fn inform(&mut self, fields: Mapping) -> Result<()> {
        for (k, v) in fields {
            if let Some(old) = self.info.get(&k) {
                if *old != v {
                    warn!("overwrite informed field {k:?}: {old:?} -> {v:?}");
                }
            }
            self.info.insert(k, v);
        }
        let body = serde_yaml::to_string(&InfoFile {
            at: Utc::now(),
            info: &self.info,
        })?;
        storage::write_all(
            &*self.storage,
            &format!("{}/{}", self.dir, self.info_file),
            body.as_bytes(),
        )
    }
}

impl Track for InfusedTracker {
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
        Self::inform(self, fields)
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
        info!(uid = %self.uid, "flush infused tracker");
        let hook = Arc::clone(&self.hook);
        hook.on_tracker_flush(self);
        self.metrics.flush()
    }

    fn activate(&mut self) {
        info!(dir = %self.dir, "activate infused tracker");
        let hook = Arc::clone(&self.hook);
        hook.on_tracker_infused(self);
    }

    fn attach(&self, name: &str) -> Result<Box<dyn WriteHandle>> {
        let path = format!("{}/{name}", self.dir);
        debug!(name, path = %path, "open attachment");
        self.storage.open_write(&path, AutoCommit::OnClose)
    }
}

#[cfg(test)]
mod tests {
    use serde_yaml::Value;

    use super::*;
    use crate::hook::NoopHook;
    use crate::storage::LocalStorage;
    use crate::tracker::Tracker;

    fn primary(dir: &std::path::Path) -> Tracker {
        Tracker::new(
            dir.to_string_lossy().into_owned(),
            "t1",
            Mapping::new(),
            Arc::new(LocalStorage),
            Arc::new(NoopHook),
        )
    }

    #[test]
    fn test_infused_shares_tid_with_own_uid() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = primary(dir.path());
        let infused = tracker.infused();
        assert_eq!(infused.tid(), tracker.tid());
        assert_ne!(infused.uid(), tracker.uid());
        assert_eq!(infused.dir(), tracker.dir());
    }

    #[test]
    fn test_inform_writes_private_file_every_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut infused = primary(dir.path()).infused();

        infused
            .inform([(Value::from("stage"), Value::from("warmup"))].into_iter().collect())
            .unwrap();
        let path = dir.path().join(infused.info_file());
        assert!(path.exists());

        infused
            .inform([(Value::from("stage"), Value::from("train"))].into_iter().collect())
            .unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("stage: train"));
        assert!(body.contains("at:"));
    }

    #[test]
    fn test_metric_files_carry_uid_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut infused = primary(dir.path()).infused();
        infused
            .meter(
                [("x".to_string(), serde_json::Value::from(1.0))].into_iter().collect(),
                None,
                None,
            )
            .unwrap();
        Track::flush(&mut infused).unwrap();

        let names = LocalStorage.list(&dir.path().to_string_lossy()).unwrap();
        let metric = names.iter().find(|n| n.starts_with("metrics-")).unwrap();
        assert!(metric.contains(infused.uid()));
    }
}
