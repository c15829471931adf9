//! CLI output formatting

use crate::core::{ExecutionStatus, OutcomeStatus, PipelineRun, StageRecord};
use crate::execution::ExecutionEvent;
use console::Emoji;
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Aborted => style("ABORTED").red().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format an outcome status for display
pub fn format_outcome(status: OutcomeStatus) -> String {
    match status {
        OutcomeStatus::Succeeded => style("ok").green().to_string(),
        OutcomeStatus::Failed => style("failed").red().to_string(),
        OutcomeStatus::TimedOut => style("timed out").red().to_string(),
        OutcomeStatus::Cancelled => style("cancelled").yellow().to_string(),
    }
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> Option<String> {
    let line = match event {
        ExecutionEvent::PipelineStarted {
            run_id,
            pipeline,
            stages,
        } => format!(
            "{} Starting pipeline {} with {} stage(s) ({})",
            ROCKET,
            style(pipeline).bold(),
            stages,
            style(&run_id.to_string()[..8]).dim()
        ),
        ExecutionEvent::StageStarted { stage, index } => {
            format!("{} {} {}", SPINNER, style(format!("[{}]", index + 1)).dim(), style(stage).cyan())
        }
        // State changes are logged; the console only shows the verdicts
        ExecutionEvent::StageStateChanged { .. } => return None,
        ExecutionEvent::UnitFinished {
            unit: Some(unit),
            status,
            elapsed,
            ..
        } => format!(
            "    {} {} ({})",
            style(unit.display()).dim(),
            format_outcome(*status),
            format_duration(*elapsed)
        ),
        ExecutionEvent::UnitFinished { .. } => return None,
        ExecutionEvent::StageFinished {
            stage,
            status,
            failed_units,
        } => {
            if status.is_success() {
                format!("{} {}", CHECK, style(stage).green())
            } else if failed_units.is_empty() {
                format!("{} {} {}", CROSS, style(stage).red(), format_outcome(*status))
            } else {
                format!(
                    "{} {} {} ({} unit(s) failed)",
                    CROSS,
                    style(stage).red(),
                    format_outcome(*status),
                    failed_units.len()
                )
            }
        }
        ExecutionEvent::StageFailureIgnored { stage, .. } => {
            format!("{} {} failed; continuing with the next stage", WARN, style(stage).yellow())
        }
        ExecutionEvent::PipelineFinished { run_id, status } => format!(
            "{} Pipeline ({}) {}",
            INFO,
            style(&run_id.to_string()[..8]).dim(),
            format_status(*status)
        ),
    };
    Some(line)
}

/// Everything needed to reproduce a failed stage by hand
pub fn format_stage_failure(record: &StageRecord) -> String {
    let mut lines = vec![format!("{} Stage {} {}", CROSS, style(&record.stage).bold(), format_outcome(record.status))];
    if let Some(error) = &record.error {
        lines.push(format!("  {}", style(error).red()));
    }
    for outcome in record.outcomes.iter().filter(|o| !o.is_success()) {
        lines.push(format!("  {} {}", style("dir:").dim(), outcome.working_dir.display()));
        lines.push(format!("  {} {}", style("command:").dim(), outcome.command));
        if !outcome.stderr.trim().is_empty() {
            lines.push(format!("  {}", style("stderr:").dim()));
            lines.push(indent(&format_output(&outcome.stderr, 20), 4));
        }
    }
    lines.join("\n")
}

/// One line per stage of a run
pub fn format_run_summary(run: &PipelineRun) -> String {
    let mut lines = vec![format!("{} {} {}", INFO, style(&run.pipeline).bold(), format_status(run.status))];
    for record in &run.stages {
        let elapsed = record
            .finished_at
            .signed_duration_since(record.started_at)
            .to_std()
            .unwrap_or_default();
        lines.push(format!(
            "  {:<16} {} ({})",
            record.stage,
            format_outcome(record.status),
            format_duration(elapsed)
        ));
    }
    lines.join("\n")
}

/// Format command output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.trim_end().to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}

fn indent(text: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    text.lines().map(|l| format!("{}{}", pad, l)).collect::<Vec<_>>().join("\n")
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
