//! Test: graph construction and ordering

use crate::helpers::*;
use ci_graph::core::{ExecutionStatus, ImageStreamTagReference, StepLink};
use ci_graph::execution::{EngineOptions, ExecutionEngine, GraphError, PipelineError, StepGraph};

#[tokio::test]
async fn test_cycle_is_rejected_before_anything_runs() {
    let recorder = Recorder::new();
    let steps = vec![
        RecordingStep::new("first", &recorder).requires("second").boxed(),
        RecordingStep::new("second", &recorder).requires("first").boxed(),
        RecordingStep::new("bystander", &recorder).boxed(),
    ];

    let err = ExecutionEngine::new(EngineOptions::default())
        .execute(steps)
        .await
        .unwrap_err();

    match err {
        PipelineError::Graph(GraphError::Cycle { steps }) => {
            assert!(steps.contains(&"first".to_string()));
            assert!(steps.contains(&"second".to_string()));
            assert!(!steps.contains(&"bystander".to_string()));
        }
        other => panic!("expected a cycle, got {:?}", other),
    }
    assert!(recorder.entries().is_empty());
}

#[tokio::test]
async fn test_duplicate_producer_is_rejected() {
    let recorder = Recorder::new();
    let steps = vec![
        RecordingStep::new("one", &recorder).creates("shared").boxed(),
        RecordingStep::new("two", &recorder).creates("shared").boxed(),
    ];

    let err = ExecutionEngine::new(EngineOptions::default())
        .execute(steps)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Graph(GraphError::DuplicateProducer { ref first, ref second, .. })
            if first == "one" && second == "two"
    ));
    assert!(recorder.entries().is_empty());
}

#[tokio::test]
async fn test_unconstrained_steps_keep_declaration_order() {
    let recorder = Recorder::new();
    let build = || {
        vec![
            RecordingStep::new("consumer", &recorder).requires("late").boxed(),
            RecordingStep::new("early", &recorder).boxed(),
            RecordingStep::new("late", &recorder).boxed(),
        ]
    };

    let first = run_steps(EngineOptions::default(), build()).await;
    let second = run_steps(EngineOptions::default(), build()).await;

    assert_eq!(report_order(&first), vec!["early", "late", "consumer"]);
    assert_eq!(report_order(&first), report_order(&second));
    assert_eq!(
        recorder.runs(),
        vec!["early", "late", "consumer", "early", "late", "consumer"]
    );
}

#[test]
fn test_unproduced_requirements_are_external() {
    let recorder = Recorder::new();
    let base = StepLink::external(ImageStreamTagReference::new("ci", "base", "9"));
    let graph = StepGraph::resolve(vec![
        RecordingStep::new("a", &recorder).requires_link(base.clone()).boxed(),
        RecordingStep::new("b", &recorder)
            .requires_link(base.clone())
            .requires("a")
            .boxed(),
    ])
    .unwrap();

    let external = graph.external_requirements();
    assert_eq!(external.len(), 1);
    assert_eq!(external[0].link, base);
    assert_eq!(external[0].required_by, vec!["a", "b"]);
}

/// Without a pre-flight client external requirements are assumed to exist
#[tokio::test]
async fn test_external_requirements_assumed_without_preflight() {
    let recorder = Recorder::new();
    let base = StepLink::external(ImageStreamTagReference::new("ci", "base", "9"));
    let report = run_steps(
        EngineOptions::default(),
        vec![RecordingStep::new("a", &recorder).requires_link(base).boxed()],
    )
    .await;
    assert_status(&report, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_preflight_fails_real_run_on_missing_artifact() {
    let recorder = Recorder::new();
    let cluster = seeded_cluster().await;
    let missing = StepLink::external(ImageStreamTagReference::new("ci", "missing", "1"));
    let present = StepLink::external(ImageStreamTagReference::new("ci", "base", "9"));

    let engine = ExecutionEngine::new(EngineOptions::default()).with_preflight(cluster, "ci-op-test");
    let err = engine
        .execute(vec![
            RecordingStep::new("a", &recorder).requires_link(present).boxed(),
            RecordingStep::new("b", &recorder).requires_link(missing.clone()).boxed(),
        ])
        .await
        .unwrap_err();

    match err {
        PipelineError::MissingPreconditions(links) => assert_eq!(links, vec![missing]),
        other => panic!("expected missing preconditions, got {:?}", other),
    }
    assert!(recorder.entries().is_empty());
}
