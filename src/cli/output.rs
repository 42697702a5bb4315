//! CLI output formatting

use crate::{
    core::{ExecutionStatus, NotAttemptedReason, RunReport, StepState},
    execution::{ExecutionEvent, StepGraph},
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Create a progress bar over `total` steps
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    if let Ok(template) =
        ProgressStyle::default_bar().template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        progress.set_style(template.progress_chars("#>-"));
    }
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Whether an event finishes a step, for progress accounting
pub fn finishes_step(event: &ExecutionEvent) -> bool {
    matches!(
        event,
        ExecutionEvent::StepSkipped { .. }
            | ExecutionEvent::StepSucceeded { .. }
            | ExecutionEvent::StepFailed { .. }
            | ExecutionEvent::StepNotAttempted { .. }
    )
}

/// Format a step state for display
pub fn format_step_state(state: &StepState) -> String {
    match state {
        StepState::Pending => style("PENDING").dim().to_string(),
        StepState::Running { .. } => style("RUNNING").yellow().to_string(),
        StepState::Skipped { .. } => style("SKIPPED").dim().to_string(),
        StepState::Succeeded { .. } => style("SUCCEEDED").green().to_string(),
        StepState::Failed { .. } => style("FAILED").red().to_string(),
        StepState::NotAttempted { reason } => {
            style(format!("NOT ATTEMPTED ({})", format_reason(reason))).yellow().to_string()
        }
    }
}

fn format_reason(reason: &NotAttemptedReason) -> String {
    match reason {
        NotAttemptedReason::BlockedBy(steps) => format!("blocked by {}", steps.join(", ")),
        NotAttemptedReason::Cancelled => "cancelled".to_string(),
    }
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PipelineStarted {
            execution_id,
            steps,
            dry_run,
        } => format!(
            "{} Starting {}{} steps ({})",
            ROCKET,
            if *dry_run { "dry run of " } else { "" },
            style(steps).bold(),
            style(&execution_id.to_string()[..8]).dim()
        ),
        ExecutionEvent::StepStarted { step } => format!("{} {}", SPINNER, style(step).cyan()),
        ExecutionEvent::StepSkipped { step } => {
            format!("{} {} {}", SKIP, style(step).dim(), style("(already done)").dim())
        }
        ExecutionEvent::StepSucceeded { step } => format!("{} {}", CHECK, style(step).green()),
        ExecutionEvent::StepFailed { step, error } => {
            format!("{} {}: {}", CROSS, style(step).red(), style(error).dim())
        }
        ExecutionEvent::StepNotAttempted { step, reason } => format!(
            "{} {} not attempted: {}",
            WARN,
            style(step).yellow(),
            format_reason(reason)
        ),
        ExecutionEvent::PipelineCompleted { execution_id, status } => format!(
            "{} Run ({}) {}",
            INFO,
            style(&execution_id.to_string()[..8]).dim(),
            format_status(*status)
        ),
    }
}

/// Horizontal rule sized to the terminal
pub fn separator() -> String {
    let width = term_size::dimensions().map(|(w, _)| w).unwrap_or(80).min(100);
    style("─".repeat(width)).dim().to_string()
}

/// Per-step table and totals printed after a run
pub fn format_summary(report: &RunReport) -> String {
    let mut lines = vec![separator()];
    let width = report.steps.iter().map(|s| s.name.len()).max().unwrap_or(0);
    for record in &report.steps {
        lines.push(format!(
            "  {:width$}  {}",
            record.name,
            format_step_state(&record.state),
            width = width
        ));
    }
    lines.push(separator());
    lines.push(format!(
        "  {} succeeded, {} skipped, {} failed, {} not attempted - {}",
        style(report.count(|s| matches!(s, StepState::Succeeded { .. }))).green(),
        style(report.count(|s| matches!(s, StepState::Skipped { .. }))).dim(),
        style(report.count(|s| matches!(s, StepState::Failed { .. }))).red(),
        style(report.count(|s| matches!(s, StepState::NotAttempted { .. }))).yellow(),
        format_status(report.status)
    ));
    for failure in report.failures() {
        lines.push(format!("  {} {}: {}", CROSS, style(&failure.step).red(), failure.error));
    }
    lines.join("\n")
}

/// Resolved order, external requirements and parameters of a graph
pub fn format_graph(graph: &StepGraph) -> String {
    let mut lines = vec![format!("{}", style("Execution order:").bold())];
    for (position, step) in graph.ordered_steps().enumerate() {
        lines.push(format!(
            "  {:>2}. {} {}",
            position + 1,
            style(step.name()).cyan(),
            style(step.description()).dim()
        ));
    }

    lines.push(format!("{}", style("External requirements:").bold()));
    if graph.external_requirements().is_empty() {
        lines.push(format!("  {}", style("none").dim()));
    }
    for requirement in graph.external_requirements() {
        lines.push(format!(
            "  {} (required by {})",
            requirement.link,
            requirement.required_by.join(", ")
        ));
    }

    lines.push(format!("{}", style("Parameters:").bold()));
    if graph.parameters().is_empty() {
        lines.push(format!("  {}", style("none").dim()));
    }
    for parameter in graph.parameters() {
        lines.push(format!(
            "  {} from {} ({})",
            style(&parameter.name).cyan(),
            parameter.producer,
            parameter.link
        ));
    }
    lines.join("\n")
}
