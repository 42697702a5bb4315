//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Run has not started
    Pending,
    /// Run is in progress
    Running,
    /// Every step succeeded or was skipped
    Completed,
    /// At least one step failed
    Failed,
    /// Run was cancelled before every step finished
    Cancelled,
}

/// Why a step never ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotAttemptedReason {
    /// One or more upstream steps failed
    BlockedBy(Vec<String>),
    /// The run was cancelled first
    Cancelled,
}

/// State of a single step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    /// Waiting for dependencies
    Pending,
    /// Currently executing
    Running {
        started_at: DateTime<Utc>,
    },
    /// Outputs already existed, the step did not run
    Skipped {
        checked_at: DateTime<Utc>,
    },
    /// Step ran and succeeded
    Succeeded {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
    /// Step ran and failed
    Failed {
        error: String,
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
    },
    /// Step never started
    NotAttempted {
        reason: NotAttemptedReason,
    },
}

impl StepState {
    /// Check if step is in a terminal state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepState::Pending | StepState::Running { .. })
    }

    /// Terminal states that count as satisfied
    pub fn is_satisfied(&self) -> bool {
        matches!(self, StepState::Skipped { .. } | StepState::Succeeded { .. })
    }
}

/// Outcome of one step in a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub description: String,
    pub state: StepState,
}

/// A step failure, as reported at the end of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: String,
    pub error: String,
}

/// Result of executing a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique execution ID
    pub execution_id: Uuid,

    pub dry_run: bool,

    pub status: ExecutionStatus,

    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Digest of the run inputs
    pub inputs_digest: String,

    /// One record per step, in resolved order
    pub steps: Vec<StepRecord>,
}

impl RunReport {
    pub fn new(dry_run: bool, inputs_digest: String, steps: Vec<StepRecord>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            dry_run,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            inputs_digest,
            steps,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Every failed step with its cause
    pub fn failures(&self) -> Vec<StepFailure> {
        self.steps
            .iter()
            .filter_map(|s| match &s.state {
                StepState::Failed { error, .. } => Some(StepFailure {
                    step: s.name.clone(),
                    error: error.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn count(&self, predicate: impl Fn(&StepState) -> bool) -> usize {
        self.steps.iter().filter(|s| predicate(&s.state)).count()
    }

    /// Settle the final status from the step states
    ///
    /// `cancelled` means the run was stopped from outside (deadline, interrupt). A run stopped
    /// by one of its own failures is `Failed`.
    pub fn finish(&mut self, cancelled: bool) {
        self.status = if self.steps.iter().all(|s| s.state.is_satisfied()) {
            ExecutionStatus::Completed
        } else if cancelled {
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Failed
        };
        self.completed_at = Some(Utc::now());
    }
}
