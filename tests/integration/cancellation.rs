// Cancel, grace period and pause/resume behaviour

use crate::common::*;
use std::thread;
use std::time::Duration;
use vidproc::engine::{CollisionPolicy, EngineError, JobStatus, Phase};

fn three_inputs(ws: &Workspace) {
    for name in ["a.mp4", "b.mp4", "c.mp4"] {
        ws.add_input(name, 100);
    }
}

#[test]
fn test_cancel_stops_running_and_queued_jobs() {
    let ws = Workspace::new();
    three_inputs(&ws);
    let mut config = ws.config();
    config.batch.workers = 1;
    let encoder = StubEncoder::new().holding().into_arc();
    let mut controller = controller(config, encoder.clone());

    controller.start().unwrap();
    assert!(encoder.wait_for_calls(1, WAIT));
    wait_for(&controller, |s| s.total_jobs() == 3);
    controller.cancel().unwrap();

    let snapshot = wait_completed(&mut controller);
    assert_eq!(snapshot.counts.cancelled, 3);
    assert_eq!(encoder.call_count(), 1);
    assert!(ws.output_files().is_empty());

    // Cancelled rows read as skipped in the CSV
    let rows = ws.csv_rows();
    assert_eq!(rows.len(), 4);
    assert!(rows[1..].iter().all(|row| row.ends_with(",Skipped,")));
}

#[test]
fn test_cancel_removes_partial_output() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 100);
    let encoder = StubEncoder::new().holding().leaving_debris().into_arc();
    let mut controller = controller(ws.config(), encoder.clone());

    controller.start().unwrap();
    assert!(encoder.wait_for_calls(1, WAIT));
    wait_for(&controller, |_| ws.output().join("a.mp4").exists());
    controller.cancel().unwrap();

    let snapshot = wait_completed(&mut controller);
    assert_eq!(job_named(&snapshot, "a.mp4").status(), JobStatus::Cancelled);
    assert!(ws.output_files().is_empty());
}

#[test]
fn test_grace_period_forces_completion() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 100);
    let mut config = ws.config();
    config.batch.cancel_grace_secs = Some(0);
    let encoder = StubEncoder::new().holding().ignoring_cancel().into_arc();
    let mut controller = controller(config, encoder.clone());

    controller.start().unwrap();
    assert!(encoder.wait_for_calls(1, WAIT));
    controller.cancel().unwrap();

    let snapshot = wait_completed(&mut controller);
    assert_eq!(snapshot.phase, Phase::Completed);
    assert_eq!(job_named(&snapshot, "a.mp4").status(), JobStatus::Cancelled);

    // A late finish from the stuck worker neither reopens the record
    // nor leaves its file at the final path
    encoder.release();
    wait_for(&controller, |_| encoder.returned_count() == 1);
    wait_for(&controller, |_| ws.output_files().is_empty());
    let after = controller.snapshot();
    assert_eq!(after.counts.cancelled, 1);
    assert_eq!(after.counts.completed, 0);
    assert!(!ws.output().join("a.mp4").exists());
}

#[test]
fn test_grace_period_keeps_preexisting_output() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 100);
    let existing = ws.add_output("a.mp4", 3);
    let mut config = ws.config();
    config.batch.collision_policy = CollisionPolicy::Overwrite;
    config.batch.cancel_grace_secs = Some(0);
    let encoder = StubEncoder::new().holding().ignoring_cancel().into_arc();
    let mut controller = controller(config, encoder.clone());

    controller.start().unwrap();
    assert!(encoder.wait_for_calls(1, WAIT));
    controller.cancel().unwrap();
    wait_completed(&mut controller);

    encoder.release();
    wait_for(&controller, |_| encoder.returned_count() == 1);
    // Let the late finish reach the aggregator
    thread::sleep(Duration::from_millis(50));
    assert!(existing.exists());
}

#[test]
fn test_cancel_twice_is_harmless() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 100);
    let encoder = StubEncoder::new().holding().into_arc();
    let mut controller = controller(ws.config(), encoder.clone());

    controller.start().unwrap();
    assert!(encoder.wait_for_calls(1, WAIT));
    controller.cancel().unwrap();
    // Either still cancelling or already completed
    match controller.cancel() {
        Ok(()) => {}
        Err(EngineError::InvalidTransition { action, phase }) => {
            assert_eq!(action, "cancel");
            assert_eq!(phase, Phase::Completed);
        }
        Err(e) => panic!("unexpected error: {e}"),
    }
    wait_completed(&mut controller);
}

#[test]
fn test_pause_holds_queue_until_resume() {
    let ws = Workspace::new();
    three_inputs(&ws);
    let mut config = ws.config();
    config.batch.workers = 1;
    let encoder = StubEncoder::new().holding().into_arc();
    let mut controller = controller(config, encoder.clone());

    controller.start().unwrap();
    assert!(encoder.wait_for_calls(1, WAIT));
    wait_for(&controller, |s| s.total_jobs() == 3);
    controller.pause().unwrap();
    assert_eq!(controller.phase(), Phase::Paused);

    // The running job finishes, nothing new starts
    encoder.release();
    wait_for(&controller, |s| s.counts.completed == 1);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(encoder.call_count(), 1);
    assert_eq!(controller.phase(), Phase::Paused);
    assert!(matches!(
        controller.pause(),
        Err(EngineError::InvalidTransition { action: "pause", .. })
    ));
    // The rejected pause leaves the queue held
    thread::sleep(Duration::from_millis(50));
    assert_eq!(encoder.call_count(), 1);

    controller.resume().unwrap();
    let snapshot = wait_completed(&mut controller);
    assert_eq!(snapshot.counts.completed, 3);
    assert_eq!(encoder.call_count(), 3);
}

#[test]
fn test_cancel_while_paused() {
    let ws = Workspace::new();
    three_inputs(&ws);
    let mut config = ws.config();
    config.batch.workers = 1;
    let encoder = StubEncoder::new().holding().into_arc();
    let mut controller = controller(config, encoder.clone());

    controller.start().unwrap();
    assert!(encoder.wait_for_calls(1, WAIT));
    wait_for(&controller, |s| s.total_jobs() == 3);
    controller.pause().unwrap();
    controller.cancel().unwrap();

    let snapshot = wait_completed(&mut controller);
    assert_eq!(snapshot.counts.cancelled, 3);
    assert_eq!(encoder.call_count(), 1);
}

#[test]
fn test_cancel_during_scan_settles_every_discovered_job() {
    let ws = Workspace::new();
    for dir in 0..40 {
        for file in 0..50 {
            ws.add_input(&format!("d{:02}/f{:02}.mp4", dir, file), 1);
        }
    }
    let mut config = ws.config();
    config.batch.workers = 1;
    let encoder = StubEncoder::new().holding().into_arc();
    let mut controller = controller(config, encoder.clone());

    controller.start().unwrap();
    assert!(encoder.wait_for_calls(1, WAIT));
    controller.cancel().unwrap();

    let snapshot = wait_completed(&mut controller);
    assert!(snapshot.total_jobs() >= 1);
    assert!(snapshot.total_jobs() <= 2000);
    assert_eq!(snapshot.counts.total(), snapshot.total_jobs());
    assert_eq!(snapshot.counts.cancelled, snapshot.total_jobs());
    assert_eq!(encoder.call_count(), 1);
    assert!(ws.output_files().is_empty());
    // One CSV row per discovered job
    assert_eq!(ws.csv_rows().len(), snapshot.total_jobs() + 1);
}
