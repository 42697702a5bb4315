//! Pipeline execution engine

pub mod engine;
pub mod executor;
pub mod resolver;
pub mod scheduler;

pub use engine::{EngineOptions, EventHandler, ExecutionEngine, ExecutionEvent, PipelineError, DEFAULT_GRACE_PERIOD};
pub use executor::StepExecutor;
pub use resolver::{DeclaredParameter, ExternalRequirement, GraphError, StepGraph};
pub use scheduler::{ExecutionScheduler, SchedulingStrategy};
