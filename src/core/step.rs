//! Step contract

use crate::clients::ClientError;
use crate::core::{
    context::StepContext,
    job_spec::InputDefinition,
    link::StepLink,
    parameters::{Provides, RegistryError},
};
use async_trait::async_trait;
use thiserror::Error;

/// Errors raised while checking or running a step
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Parameter(#[from] RegistryError),

    /// A required artifact was never created by anyone
    #[error("artifact {0} never existed")]
    MissingArtifact(String),

    #[error("{0}")]
    MalformedMetadata(String),

    /// The artifact was submitted for creation and the creation failed
    #[error("build {name} failed: {reason}")]
    BuildFailed { name: String, reason: String },

    #[error("test {name} failed: {reason}")]
    TestFailed { name: String, reason: String },

    #[error("{0}")]
    Lookup(String),

    /// The job's refs cannot be turned into a checkout script
    #[error("invalid refs: {0}")]
    InvalidRefs(String),

    #[error("step cancelled")]
    Cancelled,
}

/// A unit of pipeline work
///
/// A step declares the links it waits on and the links it guarantees once it succeeds. The
/// graph resolver connects steps only through those declarations. Implementations are
/// immutable after construction; anything mutable lives inside a single `run`.
#[async_trait]
pub trait Step: Send + Sync {
    /// Unique step name
    fn name(&self) -> &str;

    /// Human-facing description
    fn description(&self) -> String;

    /// Links that must exist before this step runs
    fn requires(&self) -> Vec<StepLink>;

    /// Links that exist once this step succeeded
    fn creates(&self) -> Vec<StepLink>;

    /// Parameters this step exposes to later steps
    fn provides(&self) -> Option<Provides> {
        None
    }

    /// Names of parameters this step reads while running
    fn consumes(&self) -> Vec<String> {
        Vec::new()
    }

    /// This step's own contribution to the run's identity
    fn inputs(&self) -> Option<InputDefinition> {
        None
    }

    /// Whether everything this step creates already exists
    async fn done(&self) -> Result<bool, StepError>;

    /// Execute the step, or simulate it when `ctx.dry_run` is set
    async fn run(&self, ctx: &StepContext) -> Result<(), StepError>;
}
