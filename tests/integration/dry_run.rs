// Dry runs plan every job without touching the filesystem

use crate::common::*;
use vidproc::engine::{CollisionPolicy, JobState, JobStatus, SkipReason};

#[test]
fn test_dry_run_writes_nothing() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 100);
    ws.add_input("nested/b.mkv", 100);
    let mut config = ws.config();
    config.batch.dry_run = true;
    let encoder = StubEncoder::new().into_arc();
    let mut controller = controller(config, encoder.clone());

    let snapshot = run_to_completion(&mut controller);
    assert_eq!(encoder.call_count(), 0);
    assert_eq!(snapshot.counts.skipped, 2);
    assert!(snapshot.jobs.iter().all(|j| matches!(
        j.state,
        JobState::Skipped {
            reason: SkipReason::DryRun
        }
    )));
    assert!(!ws.output().exists());
    assert!(!ws.csv_path().exists());
    assert!(!ws.summary_path().exists());

    let b = job_named(&snapshot, "b.mkv");
    assert_eq!(b.output_path, ws.output().join("nested/b.mkv"));
}

#[test]
fn test_dry_run_skips_encoder_preflight() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 100);
    let mut config = ws.config();
    config.batch.dry_run = true;
    let mut controller = controller(
        config,
        StubEncoder::new().unavailable("no ffmpeg").into_arc(),
    );

    let snapshot = run_to_completion(&mut controller);
    assert_eq!(snapshot.counts.skipped, 1);
}

#[test]
fn test_dry_run_reports_planned_suffix() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 100);
    ws.add_output("a.mp4", 3);
    let mut config = ws.config();
    config.batch.dry_run = true;
    config.batch.collision_policy = CollisionPolicy::Suffix;
    let mut controller = controller(config, StubEncoder::new().into_arc());

    let snapshot = run_to_completion(&mut controller);
    let a = job_named(&snapshot, "a.mp4");
    assert_eq!(a.status(), JobStatus::Skipped);
    assert_eq!(a.output_path, ws.output().join("a (1).mp4"));
    assert!(!ws.output().join("a (1).mp4").exists());
}

#[test]
fn test_dry_run_is_repeatable() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 100);
    ws.add_input("b.mp4", 100);
    ws.add_output("b.mp4", 3);
    let mut config = ws.config();
    config.batch.dry_run = true;
    let mut controller = controller(config, StubEncoder::new().into_arc());

    let first = run_to_completion(&mut controller);
    let second = run_to_completion(&mut controller);
    assert_eq!(statuses(&first), statuses(&second));
    assert_eq!(ws.output_files().len(), 1);

    // b.mp4 already exists, so it is skipped for that reason rather than the dry run
    assert!(matches!(
        job_named(&second, "b.mp4").state,
        JobState::Skipped {
            reason: SkipReason::OutputExists
        }
    ));
}
