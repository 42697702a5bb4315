//! Test: full pipelines built from configuration against the in-memory cluster

use crate::helpers::*;
use ci_graph::clients::InMemoryCluster;
use ci_graph::core::config::PipelineConfig;
use ci_graph::core::{ExecutionStatus, JobSpec};
use ci_graph::execution::{EngineOptions, ExecutionEngine, PipelineError, StepGraph};
use ci_graph::steps::{self, Clients};
use std::sync::Arc;

const CONFIG: &str = r#"
build_root: { namespace: ci, name: release, tag: golang-1.21 }
base_images:
  base: { namespace: ci, name: base, tag: "9" }
binary_build_commands: make build
images:
  - from: base
    to: widget
    context_dir: cmd/widget
    inputs:
      bin: { paths: [{ source_path: /go/bin/widget, destination_dir: . }] }
tests:
  - as: unit
    from: src
    commands: make test
    parameters: [LOCAL_IMAGE_WIDGET]
resources:
  '*': { requests: { cpu: 100m, memory: 200Mi } }
"#;

const JOB: &str = r#"{"type":"postsubmit","job":"branch-ci-acme-widget-main","buildid":"11","prowjobid":"run-11","refs":{"org":"acme","repo":"widget","base_ref":"main","base_sha":"abc123"}}"#;

const NAMESPACE: &str = "ci-op-test";

fn job_spec() -> Arc<JobSpec> {
    Arc::new(JobSpec::resolve(Some(JOB)).unwrap().in_namespace(NAMESPACE, "ci"))
}

fn engine(cluster: &Arc<InMemoryCluster>, dry_run: bool) -> ExecutionEngine {
    ExecutionEngine::new(EngineOptions {
        dry_run,
        ..EngineOptions::default()
    })
    .with_preflight(cluster.clone(), NAMESPACE)
    .with_job_inputs(job_spec().inputs())
}

fn pipeline(cluster: &Arc<InMemoryCluster>) -> Vec<Arc<dyn ci_graph::core::Step>> {
    let config = PipelineConfig::from_yaml(CONFIG).unwrap();
    steps::from_config(&config, job_spec(), &Clients::from_cluster(cluster.clone()))
}

#[tokio::test]
async fn test_full_pipeline_runs_in_dependency_order() {
    let cluster = seeded_cluster().await;
    let report = run_with_engine(&engine(&cluster, false), pipeline(&cluster)).await;

    assert_status(&report, ExecutionStatus::Completed);
    assert_eq!(
        report_order(&report),
        vec!["[input:root]", "[input:base]", "src", "bin", "widget", "unit"]
    );
    for tag in ["root", "base", "src", "bin", "widget"] {
        assert!(cluster.has_tag(NAMESPACE, "pipeline", tag).await, "missing pipeline:{}", tag);
    }

    let builds = cluster.builds().await;
    let widget = builds.iter().find(|b| b.name == "widget").unwrap();
    assert_eq!(widget.from.as_deref(), Some("pipeline:base"));
    assert_eq!(widget.labels.get("build-id").map(String::as_str), Some("11"));

    let pods = cluster.pods().await;
    assert_eq!(pods.len(), 1);
    assert_eq!(
        pods[0].env.get("LOCAL_IMAGE_WIDGET").map(String::as_str),
        Some("registry.ci.local/ci-op-test/pipeline:widget")
    );
    assert_eq!(pods[0].env.get("BUILD_ID").map(String::as_str), Some("11"));
}

#[tokio::test]
async fn test_dry_run_makes_no_mutating_calls() {
    let cluster = seeded_cluster().await;
    let report = run_with_engine(&engine(&cluster, true), pipeline(&cluster)).await;

    assert_status(&report, ExecutionStatus::Completed);
    assert!(report.dry_run);
    assert_eq!(cluster.mutating_calls(), 0);
    assert!(cluster.builds().await.is_empty());
    assert!(!cluster.has_tag(NAMESPACE, "pipeline", "src").await);
}

#[tokio::test]
async fn test_rerun_skips_every_step() {
    let cluster = seeded_cluster().await;
    run_with_engine(&engine(&cluster, false), pipeline(&cluster)).await;
    let mutations = cluster.mutating_calls();

    let report = run_with_engine(&engine(&cluster, false), pipeline(&cluster)).await;

    assert_status(&report, ExecutionStatus::Completed);
    for step in ["[input:root]", "[input:base]", "src", "bin", "widget", "unit"] {
        assert_skipped(&report, step);
    }
    assert_eq!(cluster.mutating_calls(), mutations);
}

#[tokio::test]
async fn test_failed_build_blocks_downstream() {
    let cluster = seeded_cluster().await;
    cluster.fail_build("bin", "exit status 2").await;

    let err = engine(&cluster, false)
        .execute(pipeline(&cluster))
        .await
        .unwrap_err();
    let report = match err {
        PipelineError::StepsFailed { report } => report,
        other => panic!("expected step failures, got {:?}", other),
    };

    assert_failed_with(&report, "bin", "build bin failed: exit status 2");
    assert_blocked_by(&report, "widget", "bin");
    assert_blocked_by(&report, "unit", "bin");
    assert_succeeded(&report, "src");
    assert!(cluster.pods().await.is_empty());
}

#[tokio::test]
async fn test_missing_build_root_fails_preflight() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.add_tag("ci", "base", "9").await;

    let err = engine(&cluster, false)
        .execute(pipeline(&cluster))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::MissingPreconditions(_)));
    assert!(err.to_string().contains("ci/release:golang-1.21"));
    assert_eq!(cluster.mutating_calls(), 0);
}

#[tokio::test]
async fn test_dry_run_tolerates_missing_build_root() {
    let cluster = Arc::new(InMemoryCluster::new());

    let report = run_with_engine(&engine(&cluster, true), pipeline(&cluster)).await;

    assert_status(&report, ExecutionStatus::Completed);
    assert_eq!(cluster.mutating_calls(), 0);
}

#[tokio::test]
async fn test_inputs_digest_tracks_the_configuration() {
    let cluster = seeded_cluster().await;
    let config = PipelineConfig::from_yaml(CONFIG).unwrap();
    let clients = Clients::from_cluster(cluster.clone());

    let graph = StepGraph::resolve(steps::from_config(&config, job_spec(), &clients)).unwrap();
    let same = StepGraph::resolve(steps::from_config(&config, job_spec(), &clients)).unwrap();
    assert_eq!(
        graph.inputs(job_spec().inputs()).digest(),
        same.inputs(job_spec().inputs()).digest()
    );

    let mut changed = config.clone();
    changed.binary_build_commands = Some("make build-all".to_string());
    let other = StepGraph::resolve(steps::from_config(&changed, job_spec(), &clients)).unwrap();
    assert_ne!(
        graph.inputs(job_spec().inputs()).namespace(),
        other.inputs(job_spec().inputs()).namespace()
    );
}

#[tokio::test]
async fn test_inputs_hash_the_refs_once() {
    let cluster = seeded_cluster().await;
    let config = PipelineConfig::from_yaml(CONFIG).unwrap();
    let graph = StepGraph::resolve(steps::from_config(
        &config,
        job_spec(),
        &Clients::from_cluster(cluster.clone()),
    ))
    .unwrap();

    let refs = job_spec().inputs().entries()[0].clone();
    let inputs = graph.inputs(job_spec().inputs());
    assert_eq!(inputs.entries().iter().filter(|entry| **entry == refs).count(), 1);
    assert_eq!(inputs.entries()[0], refs);
}
