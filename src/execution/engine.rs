//! Main execution engine - orchestrates the entire pipeline run

use crate::{
    clients::{ClientError, ImageClient},
    core::{
        CancelHandle, ExecutionStatus, InputDefinition, NotAttemptedReason, RegistryError, RunReport,
        Step, StepContext, StepError, StepLink, StepRecord, StepState, PIPELINE_IMAGE_STREAM,
    },
    execution::{
        resolver::{GraphError, StepGraph},
        ExecutionScheduler, SchedulingStrategy, StepExecutor,
    },
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::{self, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Grace period used when the job carries none
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Error recorded against steps still running when the grace period runs out
pub const ABORTED_ERROR: &str = "aborted after grace period";

/// Errors that end a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("pre-flight check failed: {0}")]
    Preflight(#[from] ClientError),

    #[error("required artifacts never existed: {}", format_links(.0))]
    MissingPreconditions(Vec<StepLink>),

    #[error("{}", format_failures(.report))]
    StepsFailed { report: Box<RunReport> },
}

fn format_links(links: &[StepLink]) -> String {
    links.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

fn format_failures(report: &RunReport) -> String {
    let failures = report.failures();
    let details: Vec<String> = failures
        .iter()
        .map(|f| format!("{}: {}", f.step, f.error))
        .collect();
    format!("{} step(s) failed: {}", failures.len(), details.join("; "))
}

/// Events that can occur during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        execution_id: Uuid,
        steps: usize,
        dry_run: bool,
    },
    StepStarted {
        step: String,
    },
    StepSkipped {
        step: String,
    },
    StepSucceeded {
        step: String,
    },
    StepFailed {
        step: String,
        error: String,
    },
    StepNotAttempted {
        step: String,
        reason: NotAttemptedReason,
    },
    PipelineCompleted {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Engine settings
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Simulate every step instead of mutating the cluster
    pub dry_run: bool,

    pub strategy: SchedulingStrategy,

    /// Stop starting new steps after the first failure
    pub fail_fast: bool,

    /// Cancel the run after this long
    pub deadline: Option<Duration>,

    /// How long in-flight steps may take to stop after cancellation
    pub grace_period: Option<Duration>,
}

/// Image client and namespace used to verify external requirements
struct Preflight {
    images: Arc<dyn ImageClient>,
    namespace: String,
}

/// Whether a recorded step error came from cancelling the run
fn is_cancellation(error: &str) -> bool {
    error == ABORTED_ERROR || error == StepError::Cancelled.to_string()
}

/// Step tasks in flight, keyed back to their position in the graph
#[derive(Default)]
struct RunningSteps {
    tasks: JoinSet<StepState>,
    started: HashMap<task::Id, (usize, DateTime<Utc>)>,
}

impl RunningSteps {
    fn spawn<F>(&mut self, index: usize, started_at: DateTime<Utc>, future: F)
    where
        F: Future<Output = StepState> + Send + 'static,
    {
        let handle = self.tasks.spawn(future);
        self.started.insert(handle.id(), (index, started_at));
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn abort_all(&mut self) {
        self.tasks.abort_all();
    }

    /// Next finished step; a task that ended without a result counts as failed
    async fn join_next(&mut self) -> Option<(usize, StepState)> {
        loop {
            let (id, outcome) = match self.tasks.join_next_with_id().await? {
                Ok((id, state)) => (id, Ok(state)),
                Err(e) => (e.id(), Err(e)),
            };
            let Some((index, started_at)) = self.started.remove(&id) else {
                debug!("Ignoring result of unknown task {}", id);
                continue;
            };
            let state = outcome.unwrap_or_else(|e| {
                let error = if e.is_cancelled() {
                    ABORTED_ERROR.to_string()
                } else {
                    error!("Step task ended without a result: {}", e);
                    format!("step task failed: {}", e)
                };
                StepState::Failed {
                    error,
                    started_at,
                    failed_at: Utc::now(),
                }
            });
            return Some((index, state));
        }
    }
}

/// Main pipeline execution engine
pub struct ExecutionEngine {
    executor: StepExecutor,
    options: EngineOptions,
    preflight: Option<Preflight>,
    job_inputs: InputDefinition,
    cancel: CancelHandle,
    event_handlers: Arc<Mutex<Vec<EventHandler>>>,
}

impl ExecutionEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            executor: StepExecutor::new(),
            options,
            preflight: None,
            job_inputs: InputDefinition::default(),
            cancel: CancelHandle::new(),
            event_handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Verify external requirements against `images` before any step runs
    pub fn with_preflight(mut self, images: Arc<dyn ImageClient>, namespace: impl Into<String>) -> Self {
        self.preflight = Some(Preflight {
            images,
            namespace: namespace.into(),
        });
        self
    }

    /// Inputs of the job itself, the first part of the run's inputs
    pub fn with_job_inputs(mut self, inputs: InputDefinition) -> Self {
        self.job_inputs = inputs;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Handle cancelling this engine's runs
    ///
    /// Cancelling it stops the current run and every later one. Deadlines and fail-fast only
    /// stop the run they belong to.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.lock().await.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    async fn emit_event(&self, event: ExecutionEvent) {
        let handlers = self.event_handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    /// Resolve and execute `steps`
    pub async fn execute(&self, steps: Vec<Arc<dyn Step>>) -> Result<RunReport, PipelineError> {
        let graph = StepGraph::resolve(steps)?;
        self.execute_graph(&graph).await
    }

    /// Execute an already resolved graph
    ///
    /// Returns the report unless a step failed for a reason other than cancellation, in which
    /// case the report travels inside [`PipelineError::StepsFailed`]. A cancelled run with
    /// real failures keeps the `Cancelled` status but still returns the error.
    pub async fn execute_graph(&self, graph: &StepGraph) -> Result<RunReport, PipelineError> {
        let registry = Arc::new(graph.registry()?);
        self.preflight(graph).await?;

        let inputs = graph.inputs(self.job_inputs.clone());
        let mut records: Vec<StepRecord> = graph
            .steps()
            .iter()
            .map(|step| StepRecord {
                name: step.name().to_string(),
                description: step.description(),
                state: StepState::Pending,
            })
            .collect();

        let mut report = RunReport::new(self.options.dry_run, inputs.digest(), Vec::new());
        report.status = ExecutionStatus::Running;
        let execution_id = report.execution_id;

        info!(
            "Starting pipeline execution {} ({} steps{})",
            execution_id,
            graph.len(),
            if self.options.dry_run { ", dry run" } else { "" }
        );
        self.emit_event(ExecutionEvent::PipelineStarted {
            execution_id,
            steps: graph.len(),
            dry_run: self.options.dry_run,
        })
        .await;

        // deadline and fail-fast stop this run only, never the engine's handle
        let run_cancel = self.cancel.child();
        let deadline_hit = Arc::new(AtomicBool::new(false));
        let deadline_timer = self.options.deadline.map(|deadline| {
            let cancel = run_cancel.clone();
            let deadline_hit = deadline_hit.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                warn!("Run deadline of {:?} reached, cancelling", deadline);
                deadline_hit.store(true, Ordering::SeqCst);
                cancel.cancel();
            })
        });

        let ctx = StepContext::new(self.options.dry_run, registry, run_cancel.clone());
        let mut scheduler = ExecutionScheduler::new(self.options.strategy, graph);
        let mut tasks = RunningSteps::default();
        let mut fail_fast_triggered = false;
        let mut grace_deadline: Option<Instant> = None;

        // Main execution loop
        loop {
            if !run_cancel.is_cancelled() {
                for index in scheduler.next_steps() {
                    self.start_step(graph, index, &ctx, &mut records, &mut tasks).await;
                }
            }

            if tasks.is_empty() {
                break;
            }

            let joined = if run_cancel.is_cancelled() {
                let grace = *grace_deadline.get_or_insert_with(|| {
                    let period = self.options.grace_period.unwrap_or(DEFAULT_GRACE_PERIOD);
                    info!("Waiting up to {:?} for {} running step(s)", period, tasks.len());
                    Instant::now() + period
                });
                match tokio::time::timeout_at(grace, tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        self.abort_running(&mut tasks, &mut records).await;
                        break;
                    }
                }
            } else {
                tokio::select! {
                    joined = tasks.join_next() => joined,
                    _ = run_cancel.cancelled() => continue,
                }
            };

            let Some((index, state)) = joined else {
                break;
            };

            let satisfied = state.is_satisfied();
            let failed = matches!(state, StepState::Failed { .. });
            records[index].state = state;
            self.emit_step_event(&records[index]).await;
            scheduler.complete(graph, index, satisfied);

            if failed {
                self.block_dependents(graph, index, &mut records).await;
                if self.options.fail_fast && !run_cancel.is_cancelled() {
                    warn!("Step {} failed, stopping the run (fail fast)", records[index].name);
                    fail_fast_triggered = true;
                    run_cancel.cancel();
                }
            }
        }

        if let Some(timer) = deadline_timer {
            timer.abort();
        }

        for record in records.iter_mut() {
            if matches!(record.state, StepState::Pending) {
                record.state = StepState::NotAttempted {
                    reason: NotAttemptedReason::Cancelled,
                };
                self.emit_event(ExecutionEvent::StepNotAttempted {
                    step: record.name.clone(),
                    reason: NotAttemptedReason::Cancelled,
                })
                .await;
            }
        }

        report.steps = graph.order().iter().map(|&i| records[i].clone()).collect();
        let cancelled = run_cancel.is_cancelled() && !fail_fast_triggered;
        report.finish(cancelled);

        if deadline_hit.load(Ordering::SeqCst) {
            warn!("Pipeline execution {} hit its deadline", execution_id);
        }
        info!(
            "Pipeline execution finished: {} - {:?}",
            execution_id, report.status
        );
        self.emit_event(ExecutionEvent::PipelineCompleted {
            execution_id,
            status: report.status,
        })
        .await;

        let step_failed = report
            .failures()
            .iter()
            .any(|failure| !is_cancellation(&failure.error));
        if report.status == ExecutionStatus::Failed || step_failed {
            Err(PipelineError::StepsFailed {
                report: Box::new(report),
            })
        } else {
            Ok(report)
        }
    }

    /// Check that every external requirement exists
    ///
    /// Missing artifacts fail a real run before anything starts; dry runs only warn.
    async fn preflight(&self, graph: &StepGraph) -> Result<(), PipelineError> {
        let Some(preflight) = &self.preflight else {
            for requirement in graph.external_requirements() {
                debug!("Assuming {} exists", requirement.link);
            }
            return Ok(());
        };

        let mut missing = Vec::new();
        for requirement in graph.external_requirements() {
            let found = match &requirement.link {
                StepLink::External { image } => preflight
                    .images
                    .get_image_stream_tag(&image.namespace, &image.name, &image.tag)
                    .await?
                    .is_some(),
                StepLink::Internal { tag } => preflight
                    .images
                    .get_image_stream_tag(&preflight.namespace, PIPELINE_IMAGE_STREAM, tag.as_str())
                    .await?
                    .is_some(),
            };
            if found {
                continue;
            }
            if self.options.dry_run {
                warn!(
                    "{} (required by {}) does not exist, assuming it will for the dry run",
                    requirement.link,
                    requirement.required_by.join(", ")
                );
            } else {
                error!(
                    "{} (required by {}) never existed",
                    requirement.link,
                    requirement.required_by.join(", ")
                );
                missing.push(requirement.link.clone());
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::MissingPreconditions(missing))
        }
    }

    async fn start_step(
        &self,
        graph: &StepGraph,
        index: usize,
        ctx: &StepContext,
        records: &mut [StepRecord],
        tasks: &mut RunningSteps,
    ) {
        let started_at = Utc::now();
        records[index].state = StepState::Running { started_at };
        self.emit_event(ExecutionEvent::StepStarted {
            step: records[index].name.clone(),
        })
        .await;

        let step = graph.step(index).clone();
        let executor = self.executor;
        let ctx = ctx.clone();
        tasks.spawn(index, started_at, async move {
            AssertUnwindSafe(executor.execute(step.as_ref(), &ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| StepState::Failed {
                    error: "step panicked".to_string(),
                    started_at,
                    failed_at: Utc::now(),
                })
        });
    }

    /// Mark every pending transitive dependent of a failed step as blocked
    async fn block_dependents(&self, graph: &StepGraph, failed: usize, records: &mut [StepRecord]) {
        let failed_name = records[failed].name.clone();
        for dependent in graph.transitive_dependents(failed) {
            let record = &mut records[dependent];
            if let StepState::NotAttempted {
                reason: NotAttemptedReason::BlockedBy(blockers),
            } = &mut record.state
            {
                blockers.push(failed_name.clone());
                continue;
            }
            if record.state != StepState::Pending {
                continue;
            }
            record.state = StepState::NotAttempted {
                reason: NotAttemptedReason::BlockedBy(vec![failed_name.clone()]),
            };
            warn!("Step {} not attempted: blocked by {}", record.name, failed_name);
            let event = ExecutionEvent::StepNotAttempted {
                step: record.name.clone(),
                reason: NotAttemptedReason::BlockedBy(vec![failed_name.clone()]),
            };
            self.emit_event(event).await;
        }
    }

    /// Abort tasks still running once the grace period is over
    async fn abort_running(&self, tasks: &mut RunningSteps, records: &mut [StepRecord]) {
        warn!("Grace period over, aborting {} running step(s)", tasks.len());
        tasks.abort_all();
        while let Some((index, state)) = tasks.join_next().await {
            records[index].state = state;
            self.emit_step_event(&records[index]).await;
        }
    }

    async fn emit_step_event(&self, record: &StepRecord) {
        let step = record.name.clone();
        let event = match &record.state {
            StepState::Skipped { .. } => ExecutionEvent::StepSkipped { step },
            StepState::Succeeded { .. } => ExecutionEvent::StepSucceeded { step },
            StepState::Failed { error, .. } => ExecutionEvent::StepFailed {
                step,
                error: error.clone(),
            },
            StepState::NotAttempted { reason } => ExecutionEvent::StepNotAttempted {
                step,
                reason: reason.clone(),
            },
            StepState::Pending | StepState::Running { .. } => return,
        };
        self.emit_event(event).await;
    }
}
