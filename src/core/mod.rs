//! Core domain models
//!
//! This module defines the job identity, artifact links, the step contract, parameters and
//! the state a run reports.

pub mod config;
pub mod context;
pub mod job_spec;
pub mod link;
pub mod parameters;
pub mod state;
pub mod step;

pub use context::*;
pub use job_spec::{InputDefinition, JobSpec, JobSpecError, JobType, OwnerReference, Pull, Refs};
pub use link::*;
pub use parameters::*;
pub use state::*;
pub use step::*;
