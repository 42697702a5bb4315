//! Test: failures stay local to a step and its dependents

use crate::helpers::*;
use ci_graph::core::{ExecutionStatus, NotAttemptedReason, StepState};
use ci_graph::execution::{EngineOptions, SchedulingStrategy};

/// A -> B -> C where A fails: B and C are never attempted
#[tokio::test]
async fn test_failed_step_blocks_chain() {
    let recorder = Recorder::new();
    let steps = vec![
        RecordingStep::new("a", &recorder).fails("compile error").boxed(),
        RecordingStep::new("b", &recorder).requires("a").boxed(),
        RecordingStep::new("c", &recorder).requires("b").boxed(),
    ];

    let report = run_steps(EngineOptions::default(), steps).await;

    assert_status(&report, ExecutionStatus::Failed);
    assert_failed_with(&report, "a", "compile error");
    assert_blocked_by(&report, "b", "a");
    assert_blocked_by(&report, "c", "a");
    assert_eq!(recorder.runs(), vec!["a"]);
    assert_eq!(report.failures().len(), 1);
}

/// Independent branches still run after a failure
#[tokio::test]
async fn test_independent_branches_complete() {
    let recorder = Recorder::new();
    let steps = vec![
        RecordingStep::new("a", &recorder).fails("boom").boxed(),
        RecordingStep::new("a-child", &recorder).requires("a").boxed(),
        RecordingStep::new("b", &recorder).boxed(),
        RecordingStep::new("b-child", &recorder).requires("b").boxed(),
    ];

    let report = run_steps(
        EngineOptions {
            strategy: SchedulingStrategy::Parallel,
            ..EngineOptions::default()
        },
        steps,
    )
    .await;

    assert_status(&report, ExecutionStatus::Failed);
    assert_blocked_by(&report, "a-child", "a");
    assert_succeeded(&report, "b");
    assert_succeeded(&report, "b-child");
}

/// Every failure is reported, not just the first
#[tokio::test]
async fn test_failures_are_aggregated() {
    let recorder = Recorder::new();
    let steps = vec![
        RecordingStep::new("lint", &recorder).fails("lint failed").boxed(),
        RecordingStep::new("unit", &recorder).fails("unit failed").boxed(),
        RecordingStep::new("e2e", &recorder).boxed(),
    ];

    let report = run_steps(EngineOptions::default(), steps).await;

    let failures = report.failures();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].step, "lint");
    assert_eq!(failures[1].step, "unit");
    assert_succeeded(&report, "e2e");
}

/// A step depending on two failed steps lists both as blockers
#[tokio::test]
async fn test_diamond_records_every_blocker() {
    let recorder = Recorder::new();
    let steps = vec![
        RecordingStep::new("left", &recorder).fails("left broke").boxed(),
        RecordingStep::new("right", &recorder).fails("right broke").boxed(),
        RecordingStep::new("join", &recorder)
            .requires("left")
            .requires("right")
            .boxed(),
    ];

    let report = run_steps(EngineOptions::default(), steps).await;

    match &report.step("join").unwrap().state {
        StepState::NotAttempted {
            reason: NotAttemptedReason::BlockedBy(blockers),
        } => assert_eq!(blockers, &vec!["left".to_string(), "right".to_string()]),
        other => panic!("unexpected state {:?}", other),
    }
}

/// Fail-fast stops starting new work but the run still counts as failed
#[tokio::test]
async fn test_fail_fast_leaves_branches_not_attempted() {
    let recorder = Recorder::new();
    let steps = vec![
        RecordingStep::new("a", &recorder).fails("boom").boxed(),
        RecordingStep::new("b", &recorder).boxed(),
        RecordingStep::new("c", &recorder).boxed(),
    ];

    let report = run_steps(
        EngineOptions {
            fail_fast: true,
            ..EngineOptions::default()
        },
        steps,
    )
    .await;

    assert_status(&report, ExecutionStatus::Failed);
    assert_eq!(recorder.runs(), vec!["a"]);
    for step in ["b", "c"] {
        assert_eq!(
            report.step(step).unwrap().state,
            StepState::NotAttempted {
                reason: NotAttemptedReason::Cancelled
            }
        );
    }
}

/// Without fail-fast the same run attempts every independent step
#[tokio::test]
async fn test_without_fail_fast_everything_independent_runs() {
    let recorder = Recorder::new();
    let steps = vec![
        RecordingStep::new("a", &recorder).fails("boom").boxed(),
        RecordingStep::new("b", &recorder).boxed(),
        RecordingStep::new("c", &recorder).boxed(),
    ];

    let report = run_steps(EngineOptions::default(), steps).await;

    assert_eq!(recorder.runs(), vec!["a", "b", "c"]);
    assert_succeeded(&report, "b");
    assert_succeeded(&report, "c");
}
