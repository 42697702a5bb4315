//! ci-graph - builds and tests container images as a dependency graph of steps

pub mod cli;
pub mod clients;
pub mod core;
pub mod execution;
pub mod steps;

// Re-export commonly used types
pub use clients::{BuildClient, ClientError, ImageClient, InMemoryCluster, OcClient, OcClientConfig, PodClient};
pub use core::config::PipelineConfig;
pub use core::{ExecutionStatus, JobSpec, RunReport, Step, StepContext, StepError, StepLink, StepState};
pub use execution::{EngineOptions, ExecutionEngine, ExecutionEvent, PipelineError, SchedulingStrategy, StepGraph};
