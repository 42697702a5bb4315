//! Step executor - runs individual steps

use crate::core::{NotAttemptedReason, Step, StepContext, StepError, StepState};
use chrono::Utc;
use tracing::{debug, error, info};

/// Executes a single step
///
/// Checks cancellation and the step's idempotency check before running it, and publishes the
/// step's parameters once it is satisfied. Publication happens before the returned state is
/// observed by anyone, so dependents always see the parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepExecutor;

impl StepExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Execute a step and return its terminal state
    pub async fn execute(&self, step: &dyn Step, ctx: &StepContext) -> StepState {
        let name = step.name();
        if ctx.cancel.is_cancelled() {
            debug!("Not starting step {}: run cancelled", name);
            return StepState::NotAttempted {
                reason: NotAttemptedReason::Cancelled,
            };
        }

        let started_at = Utc::now();
        let failed = |error: StepError| {
            error!("Step {} failed: {}", name, error);
            StepState::Failed {
                error: error.to_string(),
                started_at,
                failed_at: Utc::now(),
            }
        };

        match step.done().await {
            Ok(true) => {
                info!("Step {} is already satisfied, skipping", name);
                return match Self::publish(step, ctx) {
                    Ok(()) => StepState::Skipped {
                        checked_at: Utc::now(),
                    },
                    Err(e) => failed(e),
                };
            }
            Ok(false) => {}
            Err(e) => return failed(e),
        }

        info!("Executing step: {}", name);
        if let Err(e) = step.run(ctx).await {
            return failed(e);
        }

        match Self::publish(step, ctx) {
            Ok(()) => {
                info!("Step {} succeeded", name);
                StepState::Succeeded {
                    started_at,
                    completed_at: Utc::now(),
                }
            }
            Err(e) => failed(e),
        }
    }

    /// Publish the step's parameters into the run registry
    fn publish(step: &dyn Step, ctx: &StepContext) -> Result<(), StepError> {
        if let Some(provides) = step.provides() {
            ctx.parameters
                .publish(step.name(), &provides.parameters, ctx.dry_run)?;
            debug!(
                "Step {} published {} parameter(s)",
                step.name(),
                provides.parameters.len()
            );
        }
        Ok(())
    }
}
