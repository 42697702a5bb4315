use anyhow::{Context, Result};
use ci_graph::cli::commands::{RunCommand, ValidateCommand};
use ci_graph::cli::output::*;
use ci_graph::cli::{Cli, Command};
use ci_graph::clients::{InMemoryCluster, OcClient, OcClientConfig};
use ci_graph::core::config::PipelineConfig;
use ci_graph::core::job_spec::resolve_spec_from_env;
use ci_graph::core::{ExecutionStatus, JobSpec, RunReport, StepState};
use ci_graph::execution::{EngineOptions, ExecutionEngine, PipelineError, StepGraph};
use ci_graph::steps::{self, Clients};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    let success = match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

/// Steps for `config`, built against `job_spec` with its namespace settled
///
/// Without an explicit namespace the run lands in one derived from its inputs, which are only
/// known once the steps exist.
fn build_steps(config: &PipelineConfig, job_spec: JobSpec, namespace: Option<&str>, clients: &Clients) -> Result<(Arc<JobSpec>, StepGraph)> {
    let namespace = match namespace {
        Some(namespace) => namespace.to_string(),
        None => {
            let probe = steps::from_config(config, Arc::new(job_spec.clone()), clients);
            let graph = StepGraph::resolve(probe).context("Failed to resolve step graph")?;
            graph.inputs(job_spec.inputs()).namespace()
        }
    };

    let base_namespace = job_spec.base_namespace().to_string();
    let job_spec = Arc::new(job_spec.in_namespace(namespace, base_namespace));
    let graph = StepGraph::resolve(steps::from_config(config, job_spec.clone(), clients))
        .context("Failed to resolve step graph")?;
    Ok((job_spec, graph))
}

async fn run_pipeline(cmd: &RunCommand) -> Result<bool> {
    let config = PipelineConfig::from_file(&cmd.config).context("Failed to load pipeline config")?;
    let mut job_spec = resolve_spec_from_env().context("Failed to resolve job identity")?;
    job_spec = job_spec.in_namespace(String::new(), cmd.base_namespace.clone());
    if let Some(grace) = cmd.grace_period {
        job_spec = job_spec.with_grace_period(Duration::from_secs(grace));
    }
    if let Some(owner) = &cmd.owner {
        job_spec = job_spec.with_owner(owner.clone());
    }

    println!("{} Job {} at {}", INFO, style(job_spec.job()).bold(), style(job_spec.refs()).dim());

    let (clients, images) = if cmd.offline {
        let cluster = Arc::new(InMemoryCluster::new());
        (Clients::from_cluster(cluster.clone()), cluster as Arc<dyn ci_graph::ImageClient>)
    } else {
        let client = Arc::new(OcClient::new(OcClientConfig {
            oc_path: cmd.oc.clone(),
            ..OcClientConfig::default()
        }));
        (Clients::from_cluster(client.clone()), client as Arc<dyn ci_graph::ImageClient>)
    };

    let (job_spec, graph) = build_steps(&config, job_spec, cmd.namespace.as_deref(), &clients)?;
    info!("Running in namespace {}", job_spec.namespace());

    let options = EngineOptions {
        dry_run: cmd.dry_run,
        strategy: cmd.scheduling_strategy(),
        fail_fast: cmd.fail_fast,
        deadline: cmd.timeout.map(Duration::from_secs),
        grace_period: job_spec.grace_period(),
    };
    let engine = ExecutionEngine::new(options)
        .with_preflight(images, job_spec.namespace())
        .with_job_inputs(job_spec.inputs());

    // Set up event handler for console output
    let progress = create_progress_bar(graph.len());
    let bar = progress.clone();
    engine
        .add_event_handler(move |event| {
            bar.println(format_execution_event(&event));
            if finishes_step(&event) {
                bar.inc(1);
            }
        })
        .await;

    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the run");
            cancel.cancel();
        }
    });

    let result = engine.execute_graph(&graph).await;
    progress.finish_and_clear();

    let report = match result {
        Ok(report) => report,
        Err(PipelineError::StepsFailed { report }) => *report,
        Err(e) => {
            println!("{} {}", CROSS, style(&e).red());
            return Err(e).context("Pipeline did not run");
        }
    };

    println!("{}", format_summary(&report));
    if let Some(path) = &cmd.report {
        write_report(&report, path)?;
        println!("{} Report written to {}", INFO, style(path).dim());
    }

    let success = report.steps.iter().all(|s| s.state.is_satisfied());
    match report.status {
        ExecutionStatus::Completed => println!("\n{} Run completed {}", CHECK, style("successfully").green()),
        status => {
            println!("\n{} Run {}", CROSS, format_status(status));
            for record in &report.steps {
                if let StepState::Failed { error, .. } = &record.state {
                    error!("{}: {}", record.name, error);
                }
            }
        }
    }
    Ok(success)
}

fn write_report(report: &RunReport, path: &str) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write run report to {}", path))
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<bool> {
    println!("{} Validating pipeline...", INFO);

    let config = match PipelineConfig::from_file(&cmd.config) {
        Ok(config) => config,
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {:#}", style(e).red());
            return Ok(false);
        }
    };

    // Validation never talks to a cluster
    let clients = Clients::from_cluster(Arc::new(InMemoryCluster::new()));
    let job_spec = resolve_spec_from_env().unwrap_or_else(|e| {
        warn!("{}, validating with an empty job identity", e);
        JobSpec::default()
    });
    let graph = match StepGraph::resolve(steps::from_config(&config, Arc::new(job_spec), &clients)) {
        Ok(graph) => graph,
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            return Ok(false);
        }
    };

    if cmd.json {
        let data = serde_json::json!({
            "order": graph.ordered_steps().map(|s| s.name()).collect::<Vec<_>>(),
            "external_requirements": graph.external_requirements().iter().map(|r| serde_json::json!({
                "link": r.link,
                "required_by": r.required_by,
            })).collect::<Vec<_>>(),
            "parameters": graph.parameters().iter().map(|p| serde_json::json!({
                "name": p.name,
                "producer": p.producer,
                "link": p.link,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Pipeline configuration is valid!", CHECK);
        println!("{}", format_graph(&graph));
    }
    Ok(true)
}
