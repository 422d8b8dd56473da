// Retrying failed jobs of a completed batch

use crate::common::*;
use vidproc::engine::{BatchSummary, EngineError, JobStatus, Phase};

#[test]
fn test_retry_reruns_only_failed_jobs() {
    let ws = Workspace::new();
    for name in ["a.mp4", "b.mp4", "c.mp4"] {
        ws.add_input(name, 100);
    }
    let encoder = StubEncoder::new().failing_once("b.mp4").into_arc();
    let mut controller = controller(ws.config(), encoder.clone());

    let first = run_to_completion(&mut controller);
    assert_eq!(first.counts.failed, 1);
    let failed_id = job_named(&first, "b.mp4").id;

    assert_eq!(controller.retry_failed().unwrap(), 1);
    let snapshot = wait_completed(&mut controller);

    assert_eq!(snapshot.phase, Phase::Completed);
    assert_eq!(snapshot.counts.completed, 3);
    assert_eq!(snapshot.counts.failed, 0);
    assert_eq!(snapshot.total_jobs(), 3);
    assert_eq!(encoder.call_count(), 4);

    let retried = job_named(&snapshot, "b.mp4");
    assert_eq!(retried.attempt, 2);
    assert_eq!(retried.retry_of, Some(failed_id));
    assert_eq!(snapshot.superseded.len(), 1);
    assert_eq!(snapshot.superseded[0].id, failed_id);
    assert_eq!(snapshot.superseded[0].status(), JobStatus::Failed);

    // One CSV row per attempt
    let rows = ws.csv_rows();
    assert_eq!(rows.len(), 5);
    assert_eq!(rows.iter().filter(|r| r.contains(",Failed,")).count(), 1);

    let summary: BatchSummary =
        serde_json::from_str(&std::fs::read_to_string(ws.summary_path()).unwrap()).unwrap();
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.retried, 1);
}

#[test]
fn test_retry_that_fails_again_stays_failed() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 100);
    let mut controller = controller(ws.config(), StubEncoder::new().failing("a.mp4").into_arc());

    run_to_completion(&mut controller);
    assert_eq!(controller.retry_failed().unwrap(), 1);
    let snapshot = wait_completed(&mut controller);

    assert_eq!(snapshot.counts.failed, 1);
    assert_eq!(job_named(&snapshot, "a.mp4").attempt, 2);

    assert_eq!(controller.retry_failed().unwrap(), 1);
    let snapshot = wait_completed(&mut controller);
    assert_eq!(job_named(&snapshot, "a.mp4").attempt, 3);
    assert_eq!(snapshot.superseded.len(), 2);
}

#[test]
fn test_retry_without_failures_is_a_no_op() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 100);
    let encoder = StubEncoder::new().into_arc();
    let mut controller = controller(ws.config(), encoder.clone());

    run_to_completion(&mut controller);
    assert_eq!(controller.retry_failed().unwrap(), 0);
    assert_eq!(controller.phase(), Phase::Completed);
    assert_eq!(encoder.call_count(), 1);
}

#[test]
fn test_retry_rejected_while_running() {
    let ws = Workspace::new();
    ws.add_input("a.mp4", 100);
    let encoder = StubEncoder::new().holding().into_arc();
    let mut controller = controller(ws.config(), encoder.clone());

    controller.start().unwrap();
    assert!(encoder.wait_for_calls(1, WAIT));
    let err = controller.retry_failed().unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { action: "retry", .. }));

    encoder.release();
    wait_completed(&mut controller);
}
