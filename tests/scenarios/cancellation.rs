//! Test: deadlines, interrupts and the grace period

use crate::helpers::*;
use async_trait::async_trait;
use ci_graph::core::{ExecutionStatus, NotAttemptedReason, Step, StepContext, StepError, StepLink, StepState};
use ci_graph::execution::{EngineOptions, ExecutionEngine, PipelineError, SchedulingStrategy};
use std::sync::Arc;
use std::time::Duration;

/// Sleeps without ever looking at the cancel handle
struct StubbornStep;

#[async_trait]
impl Step for StubbornStep {
    fn name(&self) -> &str {
        "stubborn"
    }

    fn description(&self) -> String {
        "Ignores cancellation".to_string()
    }

    fn requires(&self) -> Vec<StepLink> {
        Vec::new()
    }

    fn creates(&self) -> Vec<StepLink> {
        vec![StepLink::internal("stubborn")]
    }

    async fn done(&self) -> Result<bool, StepError> {
        Ok(false)
    }

    async fn run(&self, _ctx: &StepContext) -> Result<(), StepError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_deadline_cancels_the_run() {
    let recorder = Recorder::new();
    let steps = vec![
        RecordingStep::new("slow", &recorder)
            .delay(Duration::from_secs(30))
            .boxed(),
        RecordingStep::new("after", &recorder).requires("slow").boxed(),
    ];

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        run_steps(
            EngineOptions {
                deadline: Some(Duration::from_millis(50)),
                ..EngineOptions::default()
            },
            steps,
        ),
    )
    .await
    .expect("deadline should stop the run");

    assert_status(&report, ExecutionStatus::Cancelled);
    assert_failed_with(&report, "slow", "step cancelled");
    assert_not_attempted(&report, "after");
    assert!(!recorder.entries().contains(&"end:slow".to_string()));
}

#[tokio::test]
async fn test_grace_period_aborts_stubborn_steps() {
    let recorder = Recorder::new();
    let steps: Vec<Arc<dyn Step>> = vec![
        Arc::new(StubbornStep),
        RecordingStep::new("later", &recorder).requires("stubborn").boxed(),
    ];

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        run_steps(
            EngineOptions {
                deadline: Some(Duration::from_millis(20)),
                grace_period: Some(Duration::from_millis(50)),
                ..EngineOptions::default()
            },
            steps,
        ),
    )
    .await
    .expect("grace period should bound the run");

    assert_status(&report, ExecutionStatus::Cancelled);
    assert_failed_with(&report, "stubborn", "aborted after grace period");
    assert_eq!(
        report.step("later").unwrap().state,
        StepState::NotAttempted {
            reason: NotAttemptedReason::Cancelled
        }
    );
}

#[tokio::test]
async fn test_cancel_before_start_attempts_nothing() {
    let recorder = Recorder::new();
    let engine = ExecutionEngine::new(EngineOptions::default());
    engine.cancel_handle().cancel();

    let report = run_with_engine(
        &engine,
        vec![
            RecordingStep::new("a", &recorder).boxed(),
            RecordingStep::new("b", &recorder).boxed(),
        ],
    )
    .await;

    assert_status(&report, ExecutionStatus::Cancelled);
    assert_not_attempted(&report, "a");
    assert_not_attempted(&report, "b");
    assert!(recorder.entries().is_empty());
}

#[tokio::test]
async fn test_interrupt_during_run() {
    let recorder = Recorder::new();
    let engine = ExecutionEngine::new(EngineOptions::default());
    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        run_with_engine(
            &engine,
            vec![
                RecordingStep::new("quick", &recorder).boxed(),
                RecordingStep::new("slow", &recorder)
                    .delay(Duration::from_secs(30))
                    .boxed(),
                RecordingStep::new("never", &recorder).boxed(),
            ],
        ),
    )
    .await
    .unwrap();

    assert_status(&report, ExecutionStatus::Cancelled);
    assert_succeeded(&report, "quick");
    assert_failed_with(&report, "slow", "step cancelled");
    assert_not_attempted(&report, "never");
}

#[tokio::test]
async fn test_engine_runs_again_after_fail_fast() {
    let recorder = Recorder::new();
    let engine = ExecutionEngine::new(EngineOptions {
        fail_fast: true,
        ..EngineOptions::default()
    });

    let first = run_with_engine(&engine, vec![RecordingStep::new("a", &recorder).fails("boom").boxed()]).await;
    assert_status(&first, ExecutionStatus::Failed);

    let second = engine
        .execute(vec![RecordingStep::new("b", &recorder).boxed()])
        .await
        .expect("second run should succeed");
    assert_status(&second, ExecutionStatus::Completed);
    assert_succeeded(&second, "b");
    assert_eq!(recorder.runs(), vec!["a", "b"]);
    assert!(!engine.cancel_handle().is_cancelled());
}

#[tokio::test]
async fn test_engine_runs_again_after_deadline() {
    let recorder = Recorder::new();
    let engine = ExecutionEngine::new(EngineOptions {
        deadline: Some(Duration::from_millis(50)),
        ..EngineOptions::default()
    });

    let first = tokio::time::timeout(
        Duration::from_secs(5),
        run_with_engine(
            &engine,
            vec![RecordingStep::new("slow", &recorder)
                .delay(Duration::from_secs(30))
                .boxed()],
        ),
    )
    .await
    .unwrap();
    assert_status(&first, ExecutionStatus::Cancelled);

    let second = engine
        .execute(vec![RecordingStep::new("quick", &recorder).boxed()])
        .await
        .expect("second run should succeed");
    assert_status(&second, ExecutionStatus::Completed);
    assert_succeeded(&second, "quick");
}

#[tokio::test]
async fn test_failures_survive_a_deadline() {
    let recorder = Recorder::new();
    let engine = ExecutionEngine::new(EngineOptions {
        strategy: SchedulingStrategy::Parallel,
        deadline: Some(Duration::from_millis(50)),
        ..EngineOptions::default()
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        engine.execute(vec![
            RecordingStep::new("a", &recorder).fails("boom").boxed(),
            RecordingStep::new("slow", &recorder)
                .delay(Duration::from_secs(30))
                .boxed(),
        ]),
    )
    .await
    .expect("deadline should stop the run");

    let report = match result {
        Err(PipelineError::StepsFailed { report }) => report,
        other => panic!("expected step failures, got {:?}", other),
    };
    assert_status(&report, ExecutionStatus::Cancelled);
    assert_failed_with(&report, "a", "boom");
    assert_failed_with(&report, "slow", "step cancelled");
}

#[tokio::test]
async fn test_cancellation_alone_is_not_an_error() {
    let recorder = Recorder::new();
    let engine = ExecutionEngine::new(EngineOptions {
        deadline: Some(Duration::from_millis(50)),
        ..EngineOptions::default()
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        engine.execute(vec![RecordingStep::new("slow", &recorder)
            .delay(Duration::from_secs(30))
            .boxed()]),
    )
    .await
    .unwrap();

    let report = result.expect("a cancelled run without step errors returns its report");
    assert_status(&report, ExecutionStatus::Cancelled);
}
