// End-to-end batches against the stub encoder

use crate::common::*;
use std::collections::HashMap;
use std::path::PathBuf;
use vidproc::engine::{EngineError, FailureKind, JobStatus, Phase};

#[test]
fn test_one_failure_does_not_stop_the_batch() {
    let ws = Workspace::new();
    for name in ["a.mp4", "b.mp4", "c.mp4", "d.mp4", "e.mp4"] {
        ws.add_input(name, 1000);
    }
    let encoder = StubEncoder::new().failing("c.mp4").into_arc();
    let mut controller = controller(ws.config(), encoder.clone());

    let snapshot = run_to_completion(&mut controller);
    assert_eq!(snapshot.phase, Phase::Completed);
    assert_eq!(snapshot.counts.completed, 4);
    assert_eq!(snapshot.counts.failed, 1);
    assert_eq!(snapshot.counts.total(), 5);
    assert_eq!(encoder.call_count(), 5);

    let failed = job_named(&snapshot, "c.mp4");
    let error = failed.error().unwrap();
    assert_eq!(error.kind, FailureKind::Encode);
    assert_eq!(error.message, "stub failure for c.mp4");

    assert_eq!(
        ws.output_files(),
        ["a.mp4", "b.mp4", "d.mp4", "e.mp4"]
            .iter()
            .map(PathBuf::from)
            .collect::<Vec<_>>()
    );
    assert_eq!(snapshot.percent, 100.0);
    assert_eq!(snapshot.eta_secs, Some(0.0));
}

#[test]
fn test_extension_filter_and_tree_mirroring() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 10);
    ws.add_input("nested/deeper/b.MKV", 10);
    ws.add_input("c.txt", 10);
    let mut controller = controller(ws.config(), StubEncoder::new().into_arc());

    let snapshot = run_to_completion(&mut controller);
    assert_eq!(snapshot.total_jobs(), 2);
    assert_eq!(snapshot.counts.completed, 2);
    assert_eq!(
        ws.output_files(),
        vec![PathBuf::from("a.mp4"), PathBuf::from("nested/deeper/b.MKV")]
    );
}

#[test]
fn test_panicking_encoder_is_isolated() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 10);
    ws.add_input("boom.mp4", 10);
    ws.add_input("z.mp4", 10);
    let mut controller = controller(
        ws.config(),
        StubEncoder::new().panicking("boom.mp4").into_arc(),
    );

    let snapshot = run_to_completion(&mut controller);
    assert_eq!(snapshot.counts.completed, 2);
    let boom = job_named(&snapshot, "boom.mp4");
    assert_eq!(boom.status(), JobStatus::Failed);
    assert!(boom.error().unwrap().message.contains("stub panic for boom.mp4"));
}

#[test]
fn test_empty_input_completes_immediately() {
    let ws = Workspace::new();
    let mut controller = controller(ws.config(), StubEncoder::new().into_arc());

    let snapshot = run_to_completion(&mut controller);
    assert_eq!(snapshot.total_jobs(), 0);
    assert_eq!(snapshot.percent, 100.0);
    // Header only
    assert_eq!(ws.csv_rows().len(), 1);
}

#[test]
fn test_metrics_and_byte_totals() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 4000);
    ws.add_input("b.mp4", 2000);
    let mut controller = controller(ws.config(), StubEncoder::new().into_arc());

    let snapshot = run_to_completion(&mut controller);
    assert_eq!(snapshot.total_bytes, 6000);
    assert_eq!(snapshot.processed_bytes, 6000);

    let a = job_named(&snapshot, "a.mp4").metrics().unwrap();
    assert_eq!(a.original_bytes, Some(4000));
    assert_eq!(a.output_bytes, Some(2000));
    assert_eq!(a.saved_bytes(), 2000);
    assert!((a.compression_ratio_pct() - 50.0).abs() < 1e-9);
    assert!(a.processing_secs >= 0.0);
}

#[test]
fn test_progress_never_regresses_per_job() {
    let ws = Workspace::new();
    for i in 0..6 {
        ws.add_input(&format!("clip{}.mp4", i), 100);
    }
    let mut controller = controller(ws.config(), StubEncoder::new().into_arc());
    let updates = controller.subscribe();

    run_to_completion(&mut controller);

    let mut seen: HashMap<_, f64> = HashMap::new();
    for snapshot in updates.try_iter() {
        for job in &snapshot.jobs {
            let Some(pct) = job.progress_percent() else {
                continue;
            };
            let last = seen.entry(job.id).or_insert(0.0);
            assert!(pct >= *last, "{} went from {} to {}", job.id, last, pct);
            *last = pct;
        }
    }
    assert_eq!(seen.len(), 6);
}

#[test]
fn test_missing_input_root_is_fatal() {
    let ws = Workspace::new();
    let mut config = ws.config();
    config.batch.input_dir = ws.tmp.path().join("nope");
    let encoder = StubEncoder::new().into_arc();
    let mut controller = controller(config, encoder.clone());

    let err = controller.start().unwrap_err();
    assert!(matches!(err, EngineError::InputRoot { .. }), "{err}");
    assert_eq!(controller.phase(), Phase::Idle);
    assert_eq!(encoder.call_count(), 0);
}

#[test]
fn test_invalid_config_is_fatal_before_any_job() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 10);
    let mut config = ws.config();
    config.encode.crf = 60;
    let mut controller = controller(config, StubEncoder::new().into_arc());

    assert!(matches!(controller.start(), Err(EngineError::Config(_))));
    assert!(!ws.csv_path().exists());

    let mut inside = ws.config();
    inside.batch.output_dir = ws.input().join("out");
    controller.set_config(inside).unwrap();
    assert!(matches!(controller.start(), Err(EngineError::Config(_))));
}

#[test]
fn test_encoder_preflight_failure_is_fatal() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 10);
    let mut controller = controller(
        ws.config(),
        StubEncoder::new().unavailable("ffmpeg not found").into_arc(),
    );

    let err = controller.start().unwrap_err();
    assert!(matches!(err, EngineError::EncoderUnavailable(ref m) if m == "ffmpeg not found"));
    assert!(!ws.output().exists());
}

#[test]
fn test_config_is_locked_while_running() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 10);
    let encoder = StubEncoder::new().holding().into_arc();
    let mut controller = controller(ws.config(), encoder.clone());
    controller.start().unwrap();
    assert!(encoder.wait_for_calls(1, WAIT));

    assert!(matches!(
        controller.set_config(ws.config()),
        Err(EngineError::ConfigLocked)
    ));
    assert!(matches!(
        controller.start(),
        Err(EngineError::InvalidTransition { action: "start", .. })
    ));

    encoder.release();
    wait_completed(&mut controller);
    let mut changed = ws.config();
    changed.encode.crf = 30;
    controller.set_config(changed).unwrap();
    assert_eq!(controller.config().encode.crf, 30);
}

#[test]
fn test_controller_can_start_again_after_completion() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 10);
    let encoder = StubEncoder::new().into_arc();
    let mut controller = controller(ws.config(), encoder.clone());

    let first = run_to_completion(&mut controller);
    assert_eq!(first.counts.completed, 1);

    // Second pass: the output now exists and the default policy skips it
    let second = run_to_completion(&mut controller);
    assert_eq!(second.counts.skipped, 1);
    assert_eq!(encoder.call_count(), 1);
}

#[test]
fn test_single_worker_runs_jobs_in_scan_order() {
    let ws = Workspace::new();
    for name in ["c.mp4", "a.mp4", "b/a.mp4", "b.mp4"] {
        ws.add_input(name, 10);
    }
    let mut config = ws.config();
    config.batch.workers = 1;
    let encoder = StubEncoder::new().into_arc();
    let mut controller = controller(config, encoder.clone());

    run_to_completion(&mut controller);
    assert_eq!(encoder.called_names(), vec!["a.mp4", "a.mp4", "b.mp4", "c.mp4"]);
}

/// `path` spelled relative to the current directory, e.g. `../../tmp/x/in`
#[cfg(unix)]
fn relative_to_cwd(path: &std::path::Path) -> PathBuf {
    let cwd = std::env::current_dir().unwrap();
    let mut relative = PathBuf::new();
    for _ in cwd.components().skip(1) {
        relative.push("..");
    }
    relative.join(path.strip_prefix("/").unwrap())
}

#[cfg(unix)]
#[test]
fn test_relative_roots_produce_absolute_records() {
    let ws = Workspace::new();
    ws.add_input("sub/a.mp4", 100);
    let mut config = ws.config();
    config.batch.input_dir = relative_to_cwd(&ws.input());
    config.batch.output_dir = relative_to_cwd(&ws.output());
    assert!(config.batch.input_dir.is_relative());
    let mut controller = controller(config, StubEncoder::new().into_arc());

    let snapshot = run_to_completion(&mut controller);
    let a = job_named(&snapshot, "a.mp4");
    assert_eq!(a.status(), JobStatus::Completed);
    assert!(a.source_path.is_absolute(), "{}", a.source_path.display());
    assert!(a.output_path.is_absolute(), "{}", a.output_path.display());
    assert_eq!(a.relative_path, PathBuf::from("sub/a.mp4"));
    assert_eq!(ws.output_files(), vec![PathBuf::from("sub/a.mp4")]);

    let row = &ws.csv_rows()[1];
    let fields: Vec<&str> = row.split(',').collect();
    assert!(fields[1].starts_with('/'));
    assert!(fields[2].starts_with('/'));
}
