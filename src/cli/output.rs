//! Output formatting for CLI commands.
//!
//! Every formatter renders either colored text with tables or pretty JSON,
//! depending on `--output`.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::planner::{Action, ApplyReport, ChangeOutcome, DiffAction, OutcomeStatus, Plan};
use crate::refresh::{DriftReport, RefreshResult};
use crate::schema::AttributeValue;
use crate::state::{LockInfo, ResourceInstance, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Apply outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
}

/// Tracked resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Provider")]
    provider: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// True if output is JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a plan. `detailed` adds attribute-level changes.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson::from(plan)),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes. Infrastructure matches the configuration.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nExecution plan (state serial {})\n", plan.state_serial);

        let rows: Vec<PlanRow> = plan
            .actionable()
            .enumerate()
            .map(|(i, change)| PlanRow {
                index: i + 1,
                action: Self::format_action(change.action),
                resource: if change.deposed {
                    format!("{} (deposed)", change.address)
                } else {
                    change.address.to_string()
                },
                reason: truncate(&change.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for change in plan.actionable().filter(|c| !c.diff.entries.is_empty()) {
                let _ = writeln!(output, "\n  {} {}", change.action.symbol(), change.address);
                for entry in change.diff.entries.values() {
                    let marker = match entry.action {
                        DiffAction::ForceNew => format!(" {}", "(forces replacement)".red()),
                        DiffAction::Computed => format!(" {}", "(known after apply)".dimmed()),
                        DiffAction::InPlace => String::new(),
                    };
                    let _ = writeln!(
                        output,
                        "      {}: {} -> {}{marker}",
                        entry.path,
                        show(entry.old.as_ref()),
                        show(entry.new.as_ref())
                    );
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            plan.count(Action::Create).to_string().green(),
            plan.count(Action::Update).to_string().yellow(),
            plan.count(Action::Replace).to_string().yellow(),
            plan.count(Action::Delete).to_string().red()
        );

        output
    }

    /// Formats the result of an apply or destroy.
    #[must_use]
    pub fn format_apply(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ApplyJson::from(report)),
            OutputFormat::Text => {
                let status = if report.success() {
                    format!("{} Apply complete", "✓".green())
                } else if report.cancelled {
                    format!("{} Apply cancelled", "⚠".yellow())
                } else {
                    format!("{} Apply failed", "✗".red())
                };

                let mut output = format!("{status}\n\n");
                let rows: Vec<OutcomeRow> = report
                    .outcomes
                    .iter()
                    .filter(|o| o.action != Action::NoOp)
                    .map(|o| OutcomeRow {
                        resource: o.address.to_string(),
                        action: o.action.to_string(),
                        status: Self::format_status(o.status),
                        id: o.provider_id.clone().unwrap_or_default(),
                        attempts: o.attempts,
                    })
                    .collect();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let failures: Vec<&ChangeOutcome> = report
                    .outcomes
                    .iter()
                    .filter(|o| o.status != OutcomeStatus::Applied && o.error.is_some())
                    .collect();
                if !failures.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for outcome in failures {
                        let _ = writeln!(
                            output,
                            "   - {}: {}",
                            outcome.address,
                            outcome.error.as_deref().unwrap_or_default()
                        );
                    }
                }

                let _ = writeln!(output, "\n{report}");
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!(
                        "{} No drift detected across {} resource(s).\n",
                        "✓".green(),
                        report.checked
                    );
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for instance in &report.drifted {
                    let _ = writeln!(output, "   ~ {} ({})", instance.address, instance.id);
                    for attr in &instance.attributes {
                        let note = if attr.overwritten {
                            String::new()
                        } else {
                            format!(" {}", "(apply will revert)".dimmed())
                        };
                        let _ = writeln!(
                            output,
                            "       {}: {} -> {}{note}",
                            attr.attribute,
                            show(attr.recorded.as_ref()),
                            show(attr.live.as_ref())
                        );
                    }
                }
                for address in &report.vanished {
                    let _ = writeln!(output, "   {} {address} no longer exists", "-".red());
                }
                let _ = write!(
                    output,
                    "\n{}/{} resources have drifted.\n",
                    report.drifted.len() + report.vanished.len(),
                    report.checked
                );
                output
            }
        }
    }

    /// Formats the result of a refresh.
    #[must_use]
    pub fn format_refresh(&self, result: &RefreshResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "state_changed": result.changed_state(),
                "serial": result.state.serial,
                "drift": result.report,
            })),
            OutputFormat::Text => {
                let mut output = self.format_drift(&result.report);
                if result.changed_state() {
                    let _ = writeln!(output, "\nState updated (serial {}).", result.state.serial);
                } else {
                    output.push_str("\nState unchanged.\n");
                }
                output
            }
        }
    }

    /// Formats a state summary with recent history.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                if !state.lineage.is_empty() {
                    let _ = writeln!(output, "   Lineage: {}", state.lineage);
                }
                let _ = writeln!(
                    output,
                    "   Config hash: {}",
                    &state.config_hash[..8.min(state.config_hash.len())]
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                        if let Some(error) = &entry.error {
                            let _ = writeln!(output, "         {}", error.dimmed());
                        }
                    }
                }

                output
            }
        }
    }

    /// Formats the list of tracked resources.
    #[must_use]
    pub fn format_resources(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => {
                let resources: Vec<&ResourceInstance> = state.resources.values().collect();
                to_json(&resources)
            }
            OutputFormat::Text => {
                if state.resources.is_empty() {
                    return String::from("No resources tracked.\n");
                }
                let rows: Vec<ResourceRow> = state
                    .resources
                    .values()
                    .map(|instance| ResourceRow {
                        address: instance.address().to_string(),
                        id: instance.id.clone(),
                        provider: instance.provider.clone(),
                        updated: instance.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats a single instance, as after import.
    #[must_use]
    pub fn format_instance(&self, instance: &ResourceInstance) -> String {
        match self.format {
            OutputFormat::Json => to_json(instance),
            OutputFormat::Text => {
                let mut output = format!("{} ({})\n", instance.address().to_string().bold(), instance.id);
                for (name, value) in &instance.attributes {
                    let _ = writeln!(output, "   {name} = {value}");
                }
                output
            }
        }
    }

    /// Formats validation results.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "resources": result.resources.len(),
                "errors": result
                    .errors
                    .iter()
                    .map(|e| serde_json::json!({ "field": e.field, "message": e.message }))
                    .collect::<Vec<_>>(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!(
                        "{} Configuration is valid ({} resources).\n",
                        "✓".green(),
                        result.resources.len()
                    )
                } else {
                    let mut output = format!("{} Configuration is invalid:\n", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                    }
                    output
                };
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats a held lock.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => to_json(lock),
            OutputFormat::Text => format!(
                "State locked: {} (holder {}, expires in {}s)\n",
                lock.lock_id,
                lock.holder,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a one-line status message.
    #[must_use]
    pub fn message(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "message": message })),
            OutputFormat::Text => format!("{message}\n"),
        }
    }

    fn format_action(action: Action) -> String {
        let label = format!("{}{action}", action.symbol());
        match action {
            Action::Create => label.green().to_string(),
            Action::Update => label.yellow().to_string(),
            Action::Replace => label.magenta().to_string(),
            Action::Delete => label.red().to_string(),
            Action::NoOp => label.dimmed().to_string(),
        }
    }

    fn format_status(status: OutcomeStatus) -> String {
        let label = status.to_string();
        match status {
            OutcomeStatus::Applied => label.green().to_string(),
            OutcomeStatus::NoOp => label.dimmed().to_string(),
            OutcomeStatus::Failed => label.red().to_string(),
            OutcomeStatus::Skipped | OutcomeStatus::Cancelled => label.yellow().to_string(),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    let mut json = serde_json::to_string_pretty(value).unwrap_or_default();
    json.push('\n');
    json
}

fn show(value: Option<&AttributeValue>) -> String {
    value.map_or_else(|| String::from("null"), ToString::to_string)
}

/// Truncates a string to at most `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson {
    config_hash: String,
    state_serial: u64,
    creates: usize,
    updates: usize,
    replaces: usize,
    deletes: usize,
    changes: Vec<ChangeJson>,
}

#[derive(Serialize)]
struct ChangeJson {
    address: String,
    action: Action,
    deposed: bool,
    reason: String,
    attributes: Vec<AttributeChangeJson>,
}

#[derive(Serialize)]
struct AttributeChangeJson {
    path: String,
    old: Option<serde_json::Value>,
    new: Option<serde_json::Value>,
    forces_replacement: bool,
    known_after_apply: bool,
}

impl From<&Plan> for PlanJson {
    fn from(plan: &Plan) -> Self {
        Self {
            config_hash: plan.config_hash.clone(),
            state_serial: plan.state_serial,
            creates: plan.count(Action::Create),
            updates: plan.count(Action::Update),
            replaces: plan.count(Action::Replace),
            deletes: plan.count(Action::Delete),
            changes: plan
                .actionable()
                .map(|change| ChangeJson {
                    address: change.address.to_string(),
                    action: change.action,
                    deposed: change.deposed,
                    reason: change.reason.clone(),
                    attributes: change
                        .diff
                        .entries
                        .values()
                        .map(|entry| AttributeChangeJson {
                            path: entry.path.clone(),
                            old: entry.old.as_ref().map(AttributeValue::to_json),
                            new: entry.new.as_ref().map(AttributeValue::to_json),
                            forces_replacement: entry.action == DiffAction::ForceNew,
                            known_after_apply: entry.action == DiffAction::Computed,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct ApplyJson<'a> {
    success: bool,
    cancelled: bool,
    serial: u64,
    outcomes: &'a [ChangeOutcome],
}

impl<'a> From<&'a ApplyReport> for ApplyJson<'a> {
    fn from(report: &'a ApplyReport) -> Self {
        Self {
            success: report.success(),
            cancelled: report.cancelled,
            serial: report.final_state.serial,
            outcomes: &report.outcomes,
        }
    }
}
