//! Test utility functions for ci-graph scenarios

use async_trait::async_trait;
use ci_graph::clients::InMemoryCluster;
use ci_graph::core::{
    ExecutionStatus, NotAttemptedReason, Parameter, ParameterMap, Provides, RunReport, Step, StepContext,
    StepError, StepLink, StepState,
};
use ci_graph::execution::{EngineOptions, ExecutionEngine, PipelineError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared log of what recording steps did, in the order they did it
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// Names of the steps that ran, in start order
    pub fn runs(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| e.strip_prefix("run:").map(str::to_string))
            .collect()
    }
}

/// Configurable step that records every call
pub struct RecordingStep {
    name: String,
    requires: Vec<StepLink>,
    creates: Vec<StepLink>,
    provides: Vec<(String, String, String)>,
    consumes: Vec<String>,
    fail: Option<String>,
    done: bool,
    delay: Option<Duration>,
    recorder: Recorder,
    accessor_calls: Arc<AtomicUsize>,
}

impl RecordingStep {
    /// A step named `name` that creates the internal link of the same name
    pub fn new(name: &str, recorder: &Recorder) -> Self {
        Self {
            name: name.to_string(),
            requires: Vec::new(),
            creates: vec![StepLink::internal(name)],
            provides: Vec::new(),
            consumes: Vec::new(),
            fail: None,
            done: false,
            delay: None,
            recorder: recorder.clone(),
            accessor_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn requires(mut self, tag: &str) -> Self {
        self.requires.push(StepLink::internal(tag));
        self
    }

    pub fn requires_link(mut self, link: StepLink) -> Self {
        self.requires.push(link);
        self
    }

    pub fn creates(mut self, tag: &str) -> Self {
        self.creates.push(StepLink::internal(tag));
        self
    }

    /// Expose `name`, resolving to `value` (or `placeholder` in dry runs)
    pub fn provides(mut self, name: &str, value: &str, placeholder: &str) -> Self {
        self.provides
            .push((name.to_string(), value.to_string(), placeholder.to_string()));
        self
    }

    pub fn consumes(mut self, name: &str) -> Self {
        self.consumes.push(name.to_string());
        self
    }

    pub fn fails(mut self, error: &str) -> Self {
        self.fail = Some(error.to_string());
        self
    }

    /// Report the step's outputs as already present
    pub fn already_done(mut self) -> Self {
        self.done = true;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Counter of how often any of this step's parameter accessors ran
    pub fn accessor_calls(&self) -> Arc<AtomicUsize> {
        self.accessor_calls.clone()
    }

    pub fn boxed(self) -> Arc<dyn Step> {
        Arc::new(self)
    }
}

#[async_trait]
impl Step for RecordingStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("Recording step {}", self.name)
    }

    fn requires(&self) -> Vec<StepLink> {
        self.requires.clone()
    }

    fn creates(&self) -> Vec<StepLink> {
        self.creates.clone()
    }

    fn provides(&self) -> Option<Provides> {
        if self.provides.is_empty() {
            return None;
        }
        let mut parameters = ParameterMap::new();
        for (name, value, placeholder) in &self.provides {
            let calls = self.accessor_calls.clone();
            let value = value.clone();
            parameters.insert(
                name.as_str(),
                Parameter::new(placeholder.as_str(), move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let value = value.clone();
                    async move { Ok(value) }
                }),
            );
        }
        Some(Provides {
            parameters,
            link: self.creates[0].clone(),
        })
    }

    fn consumes(&self) -> Vec<String> {
        self.consumes.clone()
    }

    async fn done(&self) -> Result<bool, StepError> {
        Ok(self.done)
    }

    async fn run(&self, ctx: &StepContext) -> Result<(), StepError> {
        self.recorder.record(format!("run:{}", self.name));
        for name in &self.consumes {
            let value = ctx.parameter(name).await?;
            self.recorder.record(format!("param:{}:{}={}", self.name, name, value));
        }

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
            }
        }

        self.recorder.record(format!("end:{}", self.name));
        match &self.fail {
            Some(error) => Err(StepError::Lookup(error.clone())),
            None => Ok(()),
        }
    }
}

/// Run `steps` and return the report whether or not steps failed
pub async fn run_steps(options: EngineOptions, steps: Vec<Arc<dyn Step>>) -> RunReport {
    run_with_engine(&ExecutionEngine::new(options), steps).await
}

pub async fn run_with_engine(engine: &ExecutionEngine, steps: Vec<Arc<dyn Step>>) -> RunReport {
    match engine.execute(steps).await {
        Ok(report) => report,
        Err(PipelineError::StepsFailed { report }) => *report,
        Err(e) => panic!("run did not start: {}", e),
    }
}

/// A cluster already holding the external images a typical configuration imports
pub async fn seeded_cluster() -> Arc<InMemoryCluster> {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.add_tag("ci", "release", "golang-1.21").await;
    cluster.add_tag("ci", "base", "9").await;
    cluster
}

pub fn assert_status(report: &RunReport, status: ExecutionStatus) {
    assert_eq!(
        report.status, status,
        "expected run status {:?}, steps: {:#?}",
        status, report.steps
    );
}

pub fn assert_succeeded(report: &RunReport, step: &str) {
    let record = report
        .step(step)
        .unwrap_or_else(|| panic!("step {} missing from report", step));
    assert!(
        matches!(record.state, StepState::Succeeded { .. }),
        "expected {} to succeed, got {:?}",
        step,
        record.state
    );
}

pub fn assert_skipped(report: &RunReport, step: &str) {
    let record = report.step(step).unwrap();
    assert!(
        matches!(record.state, StepState::Skipped { .. }),
        "expected {} to be skipped, got {:?}",
        step,
        record.state
    );
}

pub fn assert_failed_with(report: &RunReport, step: &str, expected: &str) {
    match &report.step(step).unwrap().state {
        StepState::Failed { error, .. } => assert!(
            error.contains(expected),
            "expected {} to fail with '{}', got '{}'",
            step,
            expected,
            error
        ),
        other => panic!("expected {} to fail, got {:?}", step, other),
    }
}

pub fn assert_blocked_by(report: &RunReport, step: &str, blocker: &str) {
    match &report.step(step).unwrap().state {
        StepState::NotAttempted {
            reason: NotAttemptedReason::BlockedBy(blockers),
        } => assert!(blockers.iter().any(|b| b == blocker), "{} blocked by {:?}", step, blockers),
        other => panic!("expected {} to be blocked by {}, got {:?}", step, blocker, other),
    }
}

pub fn assert_not_attempted(report: &RunReport, step: &str) {
    let record = report.step(step).unwrap();
    assert!(
        matches!(record.state, StepState::NotAttempted { .. }),
        "expected {} not to be attempted, got {:?}",
        step,
        record.state
    );
}

pub fn report_order(report: &RunReport) -> Vec<&str> {
    report.steps.iter().map(|s| s.name.as_str()).collect()
}
