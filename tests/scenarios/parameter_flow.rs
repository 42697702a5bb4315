//! Test: parameters flow from producers to consumers

use crate::helpers::*;
use ci_graph::core::ExecutionStatus;
use ci_graph::execution::{EngineOptions, ExecutionEngine, GraphError, PipelineError, SchedulingStrategy};
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_consumer_waits_for_producer() {
    let recorder = Recorder::new();
    // declared consumer first and linked only through the parameter
    let producer = RecordingStep::new("img", &recorder).provides("LOCAL_IMAGE_IMG", "registry/ns/pipeline:img", "fake");
    let calls = producer.accessor_calls();
    let steps = vec![
        RecordingStep::new("unit", &recorder).consumes("LOCAL_IMAGE_IMG").boxed(),
        producer.boxed(),
    ];

    let report = run_steps(
        EngineOptions {
            strategy: SchedulingStrategy::Parallel,
            ..EngineOptions::default()
        },
        steps,
    )
    .await;

    assert_status(&report, ExecutionStatus::Completed);
    assert_eq!(recorder.runs(), vec!["img", "unit"]);
    assert!(recorder
        .entries()
        .contains(&"param:unit:LOCAL_IMAGE_IMG=registry/ns/pipeline:img".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unconsumed_parameters_are_never_resolved() {
    let recorder = Recorder::new();
    let producer = RecordingStep::new("img", &recorder).provides("LOCAL_IMAGE_IMG", "value", "fake");
    let calls = producer.accessor_calls();

    let report = run_steps(EngineOptions::default(), vec![producer.boxed()]).await;

    assert_status(&report, ExecutionStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_resolved_value_is_shared_between_consumers() {
    let recorder = Recorder::new();
    let producer = RecordingStep::new("img", &recorder).provides("LOCAL_IMAGE_IMG", "value", "fake");
    let calls = producer.accessor_calls();
    let steps = vec![
        producer.boxed(),
        RecordingStep::new("unit", &recorder).consumes("LOCAL_IMAGE_IMG").boxed(),
        RecordingStep::new("e2e", &recorder).consumes("LOCAL_IMAGE_IMG").boxed(),
    ];

    run_steps(EngineOptions::default(), steps).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_skipped_producer_still_publishes() {
    let recorder = Recorder::new();
    let steps = vec![
        RecordingStep::new("img", &recorder)
            .provides("LOCAL_IMAGE_IMG", "existing", "fake")
            .already_done()
            .boxed(),
        RecordingStep::new("unit", &recorder).consumes("LOCAL_IMAGE_IMG").boxed(),
    ];

    let report = run_steps(EngineOptions::default(), steps).await;

    assert_skipped(&report, "img");
    assert_succeeded(&report, "unit");
    assert_eq!(recorder.runs(), vec!["unit"]);
    assert!(recorder
        .entries()
        .contains(&"param:unit:LOCAL_IMAGE_IMG=existing".to_string()));
}

#[tokio::test]
async fn test_dry_run_consumers_see_placeholders() {
    let recorder = Recorder::new();
    let producer = RecordingStep::new("img", &recorder).provides("LOCAL_IMAGE_IMG", "real", "dry-fake.invalid/img");
    let calls = producer.accessor_calls();
    let steps = vec![
        producer.boxed(),
        RecordingStep::new("unit", &recorder).consumes("LOCAL_IMAGE_IMG").boxed(),
    ];

    let report = run_steps(
        EngineOptions {
            dry_run: true,
            ..EngineOptions::default()
        },
        steps,
    )
    .await;

    assert!(report.dry_run);
    assert!(recorder
        .entries()
        .contains(&"param:unit:LOCAL_IMAGE_IMG=dry-fake.invalid/img".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_producer_never_publishes() {
    let recorder = Recorder::new();
    let steps = vec![
        RecordingStep::new("img", &recorder)
            .provides("LOCAL_IMAGE_IMG", "value", "fake")
            .fails("build failed")
            .boxed(),
        RecordingStep::new("unit", &recorder).consumes("LOCAL_IMAGE_IMG").boxed(),
    ];

    let report = run_steps(EngineOptions::default(), steps).await;

    assert_blocked_by(&report, "unit", "img");
    assert!(!recorder.entries().iter().any(|e| e.starts_with("param:")));
}

#[tokio::test]
async fn test_unknown_and_duplicate_parameters_are_rejected() {
    let recorder = Recorder::new();
    let engine = ExecutionEngine::new(EngineOptions::default());

    let err = engine
        .execute(vec![RecordingStep::new("unit", &recorder).consumes("NOPE").boxed()])
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Graph(GraphError::UnknownParameter { .. })));

    let err = engine
        .execute(vec![
            RecordingStep::new("a", &recorder).provides("P", "1", "x").boxed(),
            RecordingStep::new("b", &recorder).provides("P", "2", "y").boxed(),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Graph(GraphError::DuplicateParameter { .. })));
    assert!(recorder.entries().is_empty());
}
