//! End-to-end lifecycle tests through the session layer.

use std::sync::Arc;

use serde_yaml::Value;
use tracklet::{
    ActiveScope, Error, FnTrial, Mapping, Outcome, Session, TidPattern, Track, TrackOptions,
    TrackedFn, TrialFn, TrialState,
};

fn session_in(dir: &std::path::Path) -> Session {
    Session::builder()
        .path(dir.to_string_lossy().into_owned())
        .scope(Arc::new(ActiveScope::new()))
        .build()
        .unwrap()
}

fn params(pairs: &[(&str, i64)]) -> Mapping {
    pairs
        .iter()
        .map(|(k, v)| (Value::from(*k), Value::from(*v)))
        .collect()
}

#[test]
fn test_failing_callable_records_fail_and_raises_on_result() {
    let dir = tempfile::tempdir().unwrap();
    let session = session_in(dir.path());

    let trial = session
        .run(
            "t1",
            FnTrial(|_: &Mapping| -> anyhow::Result<Value> {
                Err(anyhow::anyhow!("boom"))
            }),
            params(&[("x", 1)]),
        )
        .unwrap();

    assert_eq!(trial.status().unwrap(), TrialState::Fail);
    let err = trial.result().unwrap_err();
    match err {
        Error::TrialFailed { error, .. } => assert!(error.contains("boom")),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_successful_callable_records_result_and_params() {
    let dir = tempfile::tempdir().unwrap();
    let session = session_in(dir.path());

    let trial = session
        .run("t2", FnTrial(|_: &Mapping| Ok(Value::from(7))), params(&[("n", 3)]))
        .unwrap();

    assert_eq!(trial.result().unwrap(), Some(Value::from(7)));
    assert_eq!(trial.params().unwrap(), &params(&[("n", 3)]));
    assert_eq!(trial.tid().unwrap(), "t2");
    assert_eq!(trial.status().unwrap(), TrialState::Done);
}

#[test]
fn test_callable_informs_and_meters_its_own_trial() {
    let dir = tempfile::tempdir().unwrap();
    let session = session_in(dir.path());

    let trial = session
        .run(
            "t5",
            TrackedFn(|t: &mut dyn Track, p: &Mapping| {
                let n = p.get("n").and_then(Value::as_i64).unwrap_or(0);
                t.inform([(Value::from("epoch"), Value::from(n))].into_iter().collect())?;
                t.meter(
                    [("loss".to_string(), serde_json::Value::from(0.25))]
                        .into_iter()
                        .collect(),
                    None,
                    None,
                )?;
                Ok(Value::from(n))
            }),
            params(&[("n", 2)]),
        )
        .unwrap();

    assert_eq!(trial.info().unwrap().get("epoch"), Some(&Value::from(2)));
    assert!(trial
        .attached()
        .unwrap()
        .iter()
        .any(|n| n.starts_with("metrics-")));
}

struct NestedRun {
    session: Arc<Session>,
}

impl TrialFn for NestedRun {
    fn call(&mut self, _tracker: &mut dyn Track, _params: &Mapping) -> anyhow::Result<Outcome> {
        // The outer tracker still holds the scope; a nested run must be
        // rejected before its callable executes.
        let err = self
            .session
            .run("inner", FnTrial(|_: &Mapping| Ok(Value::Null)), Mapping::new())
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateActiveTracker));
        Ok(Outcome::Value(Value::from("outer")))
    }
}

#[test]
fn test_nested_activation_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let session = Arc::new(session_in(dir.path()));

    let trial = session
        .run(
            "outer",
            NestedRun {
                session: Arc::clone(&session),
            },
            Mapping::new(),
        )
        .unwrap();
    assert_eq!(trial.result().unwrap(), Some(Value::from("outer")));
    assert!(!dir.path().join("inner").exists());
}

#[test]
fn test_track_derives_tid_and_returns_result() {
    let dir = tempfile::tempdir().unwrap();
    let session = session_in(dir.path());

    let options = TrackOptions::new()
        .name("double")
        .pattern(TidPattern::Literal("baseline".to_string()))
        .rand_slug(false);
    let result = session
        .track(
            &options,
            FnTrial(|p: &Mapping| {
                let n = p.get("n").and_then(Value::as_i64).unwrap_or(0);
                Ok(Value::from(n * 2))
            }),
            params(&[("n", 4)]),
        )
        .unwrap();

    assert_eq!(result, Some(Value::from(8)));
    assert!(dir.path().join("double/baseline").join("trial.yaml").exists());
}

#[test]
fn test_metadata_providers_captured_into_record() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::builder()
        .path(dir.path().to_string_lossy().into_owned())
        .scope(Arc::new(ActiveScope::new()))
        .meta_provider("git.commit", || Ok(Some("abc123".to_string())))
        .meta_provider("absent", || Ok(None))
        .meta_provider("broken", || Err(anyhow::anyhow!("no repo")))
        .build()
        .unwrap();

    let trial = session
        .run("t3", FnTrial(|_: &Mapping| Ok(Value::Null)), Mapping::new())
        .unwrap();

    let meta = trial.meta().unwrap();
    let git = meta.get("git").unwrap().as_mapping().unwrap();
    assert_eq!(git.get("commit"), Some(&Value::from("abc123")));
    assert!(!meta.contains_key("absent"));
    assert!(!meta.contains_key("broken"));
}

struct InformOnFlush;

impl tracklet::Hook for InformOnFlush {
    fn on_tracker_flush(&self, tracker: &mut dyn Track) {
        let fields: Mapping = [(Value::from("flushed_by"), Value::from("hook"))]
            .into_iter()
            .collect();
        tracker.inform(fields).unwrap();
    }
}

#[test]
fn test_flush_hook_mutations_land_in_record() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::builder()
        .path(dir.path().to_string_lossy().into_owned())
        .scope(Arc::new(ActiveScope::new()))
        .hook(Arc::new(InformOnFlush))
        .build()
        .unwrap();

    let trial = session
        .run("t4", FnTrial(|_: &Mapping| Ok(Value::Null)), Mapping::new())
        .unwrap();
    assert_eq!(trial.info().unwrap().get("flushed_by"), Some(&Value::from("hook")));
}

#[test]
fn test_unknown_runner_fails_at_build() {
    let err = Session::builder()
        .path(".")
        .runner_name("subprocess")
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::UnknownRunner { .. }));
}

#[test]
fn test_global_entry_points() {
    // Both halves in one test: the global slot is process-wide.
    let err = tracklet::run("g1", FnTrial(|_: &Mapping| Ok(Value::Null)), Mapping::new())
        .unwrap_err();
    assert!(matches!(err, Error::RunnerNotInitialized));

    let dir = tempfile::tempdir().unwrap();
    tracklet::init(Session::builder().path(dir.path().to_string_lossy().into_owned())).unwrap();
    let trial =
        tracklet::run("g1", FnTrial(|_: &Mapping| Ok(Value::from(1))), Mapping::new()).unwrap();
    assert_eq!(trial.result().unwrap(), Some(Value::from(1)));
}
