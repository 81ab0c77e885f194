//! Rotation behavior of the metrics exporter against real directories.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use tracklet::{LocalStorage, MetricFormat, MetricsExporter, Storage};

fn row(i: u64) -> BTreeMap<String, serde_json::Value> {
    [("i".to_string(), serde_json::Value::from(i))].into_iter().collect()
}

#[test]
fn test_default_capacity_rotates_after_ten_thousand_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut exporter = MetricsExporter::new(
        Arc::new(LocalStorage),
        dir.path().to_string_lossy().into_owned(),
    );

    for i in 0..10_001u64 {
        exporter.record(row(i), "", Some(MetricFormat::Jsonl)).unwrap();
    }
    exporter.flush().unwrap();

    let names = LocalStorage.list(&dir.path().to_string_lossy()).unwrap();
    assert_eq!(names, vec!["metrics-0000.jsonl", "metrics-0001.jsonl"]);

    let first = std::fs::read_to_string(dir.path().join("metrics-0000.jsonl")).unwrap();
    assert_eq!(first.lines().count(), 10_000);
    let second = std::fs::read_to_string(dir.path().join("metrics-0001.jsonl")).unwrap();
    assert_eq!(second.lines().count(), 1);
}

#[test]
fn test_series_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let mut exporter = MetricsExporter::new(
        Arc::new(LocalStorage),
        dir.path().to_string_lossy().into_owned(),
    )
    .with_capacity(2);

    exporter.record(row(0), "train", Some(MetricFormat::Jsonl)).unwrap();
    exporter.record(row(1), "eval", Some(MetricFormat::Csv)).unwrap();
    exporter.record(row(2), "train", Some(MetricFormat::Jsonl)).unwrap();
    // Third train row rotates train only; eval keeps buffering.
    exporter.record(row(3), "train", Some(MetricFormat::Jsonl)).unwrap();

    let names = LocalStorage.list(&dir.path().to_string_lossy()).unwrap();
    assert_eq!(names, vec!["metrics-0000-train.jsonl"]);

    exporter.flush().unwrap();
    let names = LocalStorage.list(&dir.path().to_string_lossy()).unwrap();
    assert_eq!(
        names,
        vec![
            "metrics-0000-train.jsonl",
            "metrics-0001-eval.csv",
            "metrics-0002-train.jsonl",
        ]
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// After recording `n` rows with capacity `c` and a final flush, the
    /// directory holds exactly `ceil(n / c)` files, each at most `c` rows,
    /// with gapless sequence numbers, and the row counts sum to `n`.
    #[test]
    fn prop_rotation_counts(n in 0usize..120, c in 1usize..16) {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = MetricsExporter::new(
            Arc::new(LocalStorage),
            dir.path().to_string_lossy().into_owned(),
        )
        .with_capacity(c);

        for i in 0..n {
            exporter.record(row(i as u64), "", Some(MetricFormat::Jsonl)).unwrap();
        }
        exporter.flush().unwrap();

        let names = LocalStorage.list(&dir.path().to_string_lossy()).unwrap();
        prop_assert_eq!(names.len(), n.div_ceil(c));

        let mut total = 0;
        for (seq, name) in names.iter().enumerate() {
            let expected = format!("metrics-{seq:04}.jsonl");
            prop_assert_eq!(name.as_str(), expected.as_str());
            let rows = std::fs::read_to_string(dir.path().join(name))
                .unwrap()
                .lines()
                .count();
            prop_assert!(rows <= c);
            total += rows;
        }
        prop_assert_eq!(total, n);
    }
}
