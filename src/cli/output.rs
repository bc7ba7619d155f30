//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::planner::{ActionKind, Plan, RunOutcome, RunResult};
use crate::reconciler::DriftReport;
use crate::state::{LockInfo, StateRecord, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Rank")]
    rank: usize,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Handle")]
    handle: String,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Applied")]
    applied_at: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn json<T: Serialize>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes. {} resource(s) up to date.\n",
                "✓".green(),
                plan.len()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan computed at {}\n", plan.created_at().format("%Y-%m-%d %H:%M:%S"));

        let rows: Vec<PlanActionRow> = plan
            .actions()
            .iter()
            .filter(|a| detailed || a.is_change())
            .map(|a| PlanActionRow {
                index: a.index + 1,
                action: Self::format_action_kind(a.kind),
                resource: a.id.to_string(),
                rank: a.rank,
                reason: Self::truncate(&a.reason, 40),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for action in plan.actions().iter().filter(|a| !a.diff.is_empty()) {
                let _ = writeln!(output, "\n  {} {}", Self::format_action_kind(action.kind), action.id);
                for change in action.diff.changes() {
                    let _ = writeln!(output, "      {change}");
                }
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete, {} unchanged\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.delete.to_string().red(),
            summary.unchanged
        );
        output
    }

    /// Formats the result of a run.
    #[must_use]
    pub fn format_run(&self, result: &RunResult) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&RunJson {
                outcome: result.outcome(),
                result,
            }),
            OutputFormat::Text => Self::format_run_text(result),
        }
    }

    fn format_run_text(result: &RunResult) -> String {
        let status = match result.outcome() {
            RunOutcome::Converged => format!("{} Converged", "✓".green()),
            RunOutcome::PartialFailure => format!("{} Partial failure", "✗".red()),
            RunOutcome::Interrupted => format!("{} Interrupted", "⚠".yellow()),
        };

        let mut output = format!("{status}\n\n");
        for action in &result.succeeded {
            let _ = writeln!(
                output,
                "   {} {} {}",
                "✓".green(),
                Self::format_action_kind(action.action),
                action.id
            );
        }
        for action in &result.failed {
            let _ = writeln!(
                output,
                "   {} {} {} after {} attempt(s): {}",
                "✗".red(),
                Self::format_action_kind(action.action),
                action.id,
                action.attempts,
                action.cause
            );
        }
        for action in &result.cancelled {
            let reason = action
                .blocked_by
                .as_ref()
                .map(|b| format!(" (blocked by {b})"))
                .unwrap_or_default();
            let _ = writeln!(
                output,
                "   {} {} {} cancelled{reason}",
                "-".dimmed(),
                Self::format_action_kind(action.action),
                action.id
            );
        }

        let _ = write!(
            output,
            "\n{} succeeded, {} failed, {} cancelled, {} unchanged\n",
            result.succeeded.len(),
            result.failed.len(),
            result.cancelled.len(),
            result.unchanged.len()
        );
        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    format!(
                        "{} No drift detected across {} resource(s).\n",
                        "✓".green(),
                        report.checked
                    )
                } else {
                    format!("{} {report}", "⚠".yellow())
                }
            }
        }
    }

    /// Formats every record of a snapshot.
    #[must_use]
    pub fn format_records(&self, snapshot: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&snapshot.records().collect::<Vec<_>>()),
            OutputFormat::Text => {
                if snapshot.is_empty() {
                    return String::from("No resources recorded.\n");
                }
                let rows: Vec<RecordRow> = snapshot
                    .records()
                    .map(|r| RecordRow {
                        resource: r.id.to_string(),
                        handle: Self::truncate(&r.handle, 60),
                        hash: r.attributes_hash.chars().take(12).collect(),
                        applied_at: r.applied_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                format!("{}\n\n{} resource(s)\n", Table::new(rows), snapshot.len())
            }
        }
    }

    /// Formats a single record.
    #[must_use]
    pub fn format_record(&self, record: &StateRecord) -> String {
        match self.format {
            OutputFormat::Json => Self::json(record),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "{}", record.id.to_string().bold());
                let _ = writeln!(output, "   Handle:  {}", record.handle);
                let _ = writeln!(output, "   Hash:    {}", record.attributes_hash);
                let _ = writeln!(output, "   Applied: {}", record.applied_at.to_rfc3339());
                if !record.dependencies.is_empty() {
                    let deps: Vec<String> = record.dependencies.iter().map(ToString::to_string).collect();
                    let _ = writeln!(output, "   Depends: {}", deps.join(", "));
                }
                let _ = writeln!(output, "   Attributes:");
                for (key, value) in &record.attributes {
                    let _ = writeln!(output, "      {key} = {value}");
                }
                output
            }
        }
    }

    /// Formats run lock information.
    #[must_use]
    pub fn format_lock(&self, lock: Option<&LockInfo>) -> String {
        match (self.format, lock) {
            (OutputFormat::Json, _) => Self::json(&lock),
            (OutputFormat::Text, None) => String::from("State is not locked.\n"),
            (OutputFormat::Text, Some(lock)) => format!(
                "Locked by {} since {} (lock {}, expires in {}s)\n",
                lock.holder,
                lock.acquired_at.to_rfc3339(),
                lock.lock_id,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats an action kind with color.
    fn format_action_kind(kind: ActionKind) -> String {
        match kind {
            ActionKind::Create => "+create".green().to_string(),
            ActionKind::Update => "~update".yellow().to_string(),
            ActionKind::Delete => "-delete".red().to_string(),
            ActionKind::NoOp => "noop".dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}

#[derive(Serialize)]
struct RunJson<'a> {
    outcome: RunOutcome,
    #[serde(flatten)]
    result: &'a RunResult,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ResourceId, ResourceKind};
    use crate::planner::{CancelledAction, CompletedAction, FailedAction};

    fn result() -> RunResult {
        RunResult {
            succeeded: vec![CompletedAction {
                id: ResourceId::new(ResourceKind::Network, "vpc"),
                action: ActionKind::Create,
                attempts: 1,
            }],
            failed: vec![FailedAction {
                id: ResourceId::new(ResourceKind::ManagedCluster, "main"),
                action: ActionKind::Create,
                cause: String::from("unsupported version"),
                attempts: 1,
            }],
            cancelled: vec![CancelledAction {
                id: ResourceId::new(ResourceKind::NodeGroup, "workers"),
                action: ActionKind::Create,
                blocked_by: Some(ResourceId::new(ResourceKind::ManagedCluster, "main")),
            }],
            unchanged: Vec::new(),
        }
    }

    #[test]
    fn test_run_json_includes_outcome() {
        let json = OutputFormatter::new(OutputFormat::Json).format_run(&result());
        let value: serde_json::Value = serde_json::from_str(&json).expect("json");

        assert_eq!(value["outcome"], "partial_failure");
        assert_eq!(value["failed"][0]["attempts"], 1);
        assert_eq!(value["cancelled"][0]["id"]["name"], "workers");
    }

    #[test]
    fn test_run_text_lists_every_action() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_run(&result());

        assert!(text.contains("Partial failure"));
        assert!(text.contains("network/vpc"));
        assert!(text.contains("blocked by managed_cluster/main"));
        assert!(text.contains("1 succeeded, 1 failed, 1 cancelled, 0 unchanged"));
    }

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("abcdefghijkl", 8), "abcde...");
    }
}
