//! CLI command definitions

use crate::core::OwnerReference;
use crate::execution::SchedulingStrategy;
use clap::Args;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to the pipeline YAML file
    #[arg(short, long)]
    pub config: String,

    /// Exercise every step without mutating the cluster
    #[arg(long)]
    pub dry_run: bool,

    /// Use an in-process cluster instead of `oc`
    #[arg(long)]
    pub offline: bool,

    /// Namespace to run in (derived from the run inputs when omitted)
    #[arg(long)]
    pub namespace: Option<String>,

    /// Namespace holding shared base images
    #[arg(long, default_value = "stable")]
    pub base_namespace: String,

    /// Scheduling strategy
    #[arg(long, value_enum, default_value_t = SchedulingStrategyArg::Sequential)]
    pub strategy: SchedulingStrategyArg,

    /// Concurrency limit for parallel-limited
    #[arg(long, default_value_t = 4)]
    pub max_parallel: usize,

    /// Stop starting steps after the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Cancel the run after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Seconds running steps get to stop after cancellation
    #[arg(long)]
    pub grace_period: Option<u64>,

    /// Owner of created objects, as KIND/NAME/UID
    #[arg(long, value_parser = parse_owner)]
    pub owner: Option<OwnerReference>,

    /// Path to the `oc` binary
    #[arg(long, default_value = "oc")]
    pub oc: String,

    /// Write the JSON run report to this file
    #[arg(long)]
    pub report: Option<String>,
}

impl RunCommand {
    pub fn scheduling_strategy(&self) -> SchedulingStrategy {
        match self.strategy {
            SchedulingStrategyArg::Sequential => SchedulingStrategy::Sequential,
            SchedulingStrategyArg::Parallel => SchedulingStrategy::Parallel,
            SchedulingStrategyArg::ParallelLimited => SchedulingStrategy::LimitedParallel(self.max_parallel),
        }
    }
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to the pipeline YAML file
    #[arg(short, long)]
    pub config: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Scheduling strategy argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SchedulingStrategyArg {
    Sequential,
    Parallel,
    #[clap(name = "parallel-limited")]
    ParallelLimited,
}

/// Parse KIND/NAME/UID
pub fn parse_owner(s: &str) -> Result<OwnerReference, String> {
    OwnerReference::parse(s).ok_or_else(|| format!("Invalid owner reference (want KIND/NAME/UID): {}", s))
}
