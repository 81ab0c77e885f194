//! Metrics exporter: buffered, rotating per-series metric files
//!
//! Rows are buffered in memory per series and rotated out to immutable,
//! numbered files once a series reaches the per-file row capacity. Rotated
//! files are never reopened; the sequence counter is exporter-wide and
//! strictly increasing with no gaps.
//!
//! Each series commits to one export format with its first recorded row.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::{self, Storage};

/// Default per-file row capacity.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Export format of a metric series, fixed by the series' first row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricFormat {
    /// Tabulated rows, `at` column first, missing keys as empty cells.
    Csv,
    /// One self-describing JSON object per line, keys sorted.
    Jsonl,
}

impl MetricFormat {
    const fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Jsonl => "jsonl",
        }
    }
}

impl std::fmt::Display for MetricFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// One recorded metric row: named values plus an injected wall-clock stamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    /// Wall-clock time in seconds.
    pub at: f64,
    /// Metric-name to value mapping.
    pub values: BTreeMap<String, serde_json::Value>,
}

/// Serializable exporter state carried inside trial snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterState {
    seq: u32,
    formats: BTreeMap<String, MetricFormat>,
    buffers: BTreeMap<String, Vec<MetricRow>>,
}

/// Buffered, rotating metrics exporter for one trial directory.
pub struct MetricsExporter {
    storage: Arc<dyn Storage>,
    dir: String,
    buffers: BTreeMap<String, Vec<MetricRow>>,
    formats: BTreeMap<String, MetricFormat>,
    capacity: usize,
    seq: u32,
    uid_suffix: Option<String>,
}

impl MetricsExporter {
    /// Create an exporter writing into `dir` with the default capacity.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, dir: impl Into<String>) -> Self {
        Self {
            storage,
            dir: dir.into(),
            buffers: BTreeMap::new(),
            formats: BTreeMap::new(),
            capacity: DEFAULT_CAPACITY,
            seq: 0,
            uid_suffix: None,
        }
    }

    /// Set the per-file row capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Add an exporter-wide unique file suffix so a secondary tracker's files
    /// never collide with the primary tracker's.
    #[must_use]
    pub fn with_uid_suffix(mut self, uid: impl Into<String>) -> Self {
        self.uid_suffix = Some(uid.into());
        self
    }

    /// Record one row under a series.
    ///
    /// The first row fixes the series' format (`None` means CSV). If the
    /// series buffer is at capacity, it is rotated before the row is appended,
    /// so no file ever exceeds the capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FormatMismatch`] when the requested format disagrees
    /// with the series' fixed format, or an IO error from rotation.
    pub fn record(
        &mut self,
        values: BTreeMap<String, serde_json::Value>,
        series: &str,
        format: Option<MetricFormat>,
    ) -> Result<()> {
        let format = format.unwrap_or(MetricFormat::Csv);
        let fixed = *self.formats.entry(series.to_string()).or_insert(format);
        if fixed != format {
            return Err(Error::FormatMismatch {
                series: series.to_string(),
                fixed: fixed.to_string(),
                requested: format.to_string(),
            });
        }

        if self.buffers.get(series).is_some_and(|b| b.len() >= self.capacity) {
            self.flush_series(series)?;
        }

        let at = Utc::now().timestamp_micros() as f64 / 1e6;
        self.buffers
            .entry(series.to_string())
            .or_default()
            .push(MetricRow { at, values });
        Ok(())
    }

    /// Rotate one series out to a numbered file. No-op when its buffer is empty.
    ///
    /// # Errors
    ///
    /// Returns an error when the rotated file cannot be written.
    pub fn flush_series(&mut self, series: &str) -> Result<()> {
        let Some(format) = self.formats.get(series).copied() else {
            return Ok(());
        };
        let rows = match self.buffers.get_mut(series) {
            Some(rows) if !rows.is_empty() => std::mem::take(rows),
            _ => return Ok(()),
        };

        let name = self.file_name(series, format);
        debug!(file = %name, rows = rows.len(), "write metrics");
        let body = match format {
            MetricFormat::Csv => render_csv(&rows),
            MetricFormat::Jsonl => render_jsonl(&rows)?,
        };
        storage::write_all(&*self.storage, &format!("{}/{name}", self.dir), body.as_bytes())?;
        self.seq += 1;
        Ok(())
    }

    /// Rotate every series with a non-empty buffer.
    ///
    /// # Errors
    ///
    /// Returns the first rotation error encountered.
    pub fn flush(&mut self) -> Result<()> {
        let series: Vec<String> = self.buffers.keys().cloned().collect();
        for s in series {
            self.flush_series(&s)?;
        }
        Ok(())
    }

    /// Export the buffered state for inclusion in a trial snapshot.
    #[must_use]
    pub fn state(&self) -> ExporterState {
        ExporterState {
            seq: self.seq,
            formats: self.formats.clone(),
            buffers: self.buffers.clone(),
        }
    }

    /// Restore buffered state from a trial snapshot.
    pub fn restore(&mut self, state: ExporterState) {
        self.seq = state.seq;
        self.formats = state.formats;
        self.buffers = state.buffers;
    }

    fn file_name(&self, series: &str, format: MetricFormat) -> String {
        let slug = self
            .uid_suffix
            .as_deref()
            .map(|u| format!("-{u}"))
            .unwrap_or_default();
        let ext = format.extension();
        if series.is_empty() {
            format!("metrics{slug}-{:04}.{ext}", self.seq)
        } else {
            format!("metrics{slug}-{:04}-{series}.{ext}", self.seq)
        }
    }
}

fn render_jsonl(rows: &[MetricRow]) -> Result<String> {
    let mut out = String::new();
    for row in rows {
        let mut obj: BTreeMap<String, serde_json::Value> = row.values.clone();
        obj.insert("at".to_string(), row.at.into());
        out.push_str(&serde_json::to_string(&obj)?);
        out.push('\n');
    }
    Ok(out)
}

fn render_csv(rows: &[MetricRow]) -> String {
    let mut columns: Vec<&str> = Vec::new();
    for row in rows {
        for key in row.values.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }

    let mut out = String::from("at");
    for c in &columns {
        out.push(',');
        out.push_str(&csv_escape(c));
    }
    out.push('\n');

    for row in rows {
        out.push_str(&format!("{}", row.at));
        for c in &columns {
            out.push(',');
            if let Some(v) = row.values.get(*c) {
                out.push_str(&csv_escape(&csv_cell(v)));
            }
        }
        out.push('\n');
    }
    out
}

fn csv_cell(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn csv_escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}
