//! Output formatting for CLI commands.
//!
//! Text output is coloured tables; JSON and YAML render the underlying
//! serializable types for scripting.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use std::path::Path;
use tabled::{Table, Tabled};

use crate::config::{DeployConfig, ValidationResult};
use crate::orchestrator::{DeployReport, DeploymentResult, Drift, ObservedResource};
use crate::planner::{ChangeAction, Plan};
use crate::state::{LockInfo, ResourceState, State};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Provider")]
    provider: String,
    #[tabled(rename = "Changes")]
    changes: String,
}

/// Resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Provider")]
    provider: String,
    #[tabled(rename = "ID")]
    id: String,
}

/// Environment row for table display.
/// Observed resource row for table display.
#[derive(Tabled)]
struct DriftRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Provider")]
    provider: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Reported")]
    status: String,
    #[tabled(rename = "Drift")]
    drift: String,
}

#[derive(Tabled)]
struct EnvironmentRow {
    #[tabled(rename = "Environment")]
    name: String,
    #[tabled(rename = "Provider")]
    provider: String,
    #[tabled(rename = "Region")]
    region: String,
    #[tabled(rename = "Resources")]
    resources: usize,
    #[tabled(rename = "Tags")]
    tags: String,
}

#[derive(Serialize)]
struct EnvironmentSummary<'a> {
    name: &'a str,
    provider: Option<&'a str>,
    region: Option<&'a str>,
    resources: usize,
    tags: &'a std::collections::BTreeMap<String, String>,
}

#[derive(Serialize)]
struct LockReport<'a> {
    environment: &'a str,
    released: bool,
    lock: Option<&'a LockInfo>,
}

#[derive(Serialize)]
struct DriftReport<'a> {
    environment: &'a str,
    resources: &'a [ObservedResource],
}

#[derive(Serialize)]
struct BackupReport<'a> {
    environment: &'a str,
    path: &'a Path,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns the output format.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    /// Renders a value as JSON or YAML, or `None` for text output.
    fn structured<T: Serialize + ?Sized>(&self, value: &T) -> Option<String> {
        match self.format {
            OutputFormat::Json => Some(serde_json::to_string_pretty(value).unwrap_or_default()),
            OutputFormat::Yaml => Some(serde_yaml::to_string(value).unwrap_or_default()),
            OutputFormat::Text => None,
        }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        self.structured(plan)
            .unwrap_or_else(|| Self::format_plan_text(plan))
    }

    fn format_plan_text(plan: &Plan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes for '{}', {} resource(s) up to date.\n",
                "✓".green(),
                plan.environment,
                plan.unchanged
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan for '{}'", plan.environment.bold());
        let _ = writeln!(output, "   Config hash: {}\n", short(&plan.config_hash));

        let rows: Vec<ChangeRow> = plan
            .changes()
            .map(|change| ChangeRow {
                action: Self::format_action(change.action),
                resource: change.name.clone(),
                resource_type: change.resource_type().to_string(),
                provider: change.provider().to_string(),
                changes: change
                    .changes
                    .iter()
                    .map(|c| truncate(&c.to_string(), 48))
                    .collect::<Vec<_>>()
                    .join("\n"),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = writeln!(
            output,
            "\nPlan: {} to add, {} to update, {} to delete, {} unchanged",
            plan.add_resources.len().to_string().green(),
            plan.update_resources.len().to_string().yellow(),
            plan.delete_resources.len().to_string().red(),
            plan.unchanged
        );

        output
    }

    /// Formats the outcome of a deploy.
    #[must_use]
    pub fn format_report(&self, report: &DeployReport) -> String {
        if let Some(structured) = self.structured(report) {
            return structured;
        }

        let mut output = String::new();
        match (&report.result, &report.failure) {
            (Some(result), _) => {
                let _ = writeln!(output, "{} {}", "✓".green(), result);
                Self::write_outputs(&mut output, result);
            }
            (None, Some(failure)) => {
                let _ = writeln!(
                    output,
                    "{} Deploy of '{}' failed, {} operation(s) failed",
                    "✗".red(),
                    report.environment,
                    failure.failures.len()
                );
                for f in &failure.failures {
                    let _ = writeln!(output, "   - {f}");
                }
                if !failure.not_started.is_empty() {
                    let _ = writeln!(output, "   Not started: {}", failure.not_started.join(", "));
                }
                if let Some(rollback) = &report.rollback {
                    let _ = writeln!(output, "{} {}", "↺".yellow(), rollback);
                }
            }
            (None, None) => {
                let _ = writeln!(output, "Deploy of '{}': {}", report.environment, report.phase);
            }
        }

        if let Some(path) = &report.backup {
            let _ = writeln!(output, "   Backup: {}", path.display());
        }

        output
    }

    fn write_outputs(output: &mut String, result: &DeploymentResult) {
        if result.outputs.is_empty() {
            return;
        }
        output.push_str("\nOutputs:\n");
        for (resource, values) in &result.outputs {
            for (key, value) in values {
                let _ = writeln!(output, "   {resource}.{key} = {value}");
            }
        }
    }

    /// Formats the state of one environment.
    #[must_use]
    pub fn format_state(&self, state: &State) -> String {
        self.structured(state)
            .unwrap_or_else(|| Self::format_state_text(state))
    }

    /// Formats the states of several environments.
    #[must_use]
    pub fn format_states(&self, states: &[State]) -> String {
        if let Some(structured) = self.structured(states) {
            return structured;
        }
        if states.is_empty() {
            return String::from("No environment state recorded.\n");
        }
        states.iter().map(Self::format_state_text).collect()
    }

    fn format_state_text(state: &State) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "\nEnvironment: {}", state.environment.bold());
        let _ = writeln!(
            output,
            "   Last update: {}",
            state
                .last_update
                .map_or_else(|| String::from("never"), |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        );

        if state.resources.is_empty() {
            output.push_str("   No resources recorded.\n");
            return output;
        }

        let rows: Vec<ResourceRow> = state
            .resources
            .iter()
            .map(|(name, record)| ResourceRow {
                name: name.clone(),
                status: Self::format_resource_state(record.state()),
                resource_type: record.resource_type.clone(),
                provider: record.provider.clone(),
                id: record.id.as_deref().map_or_else(|| String::from("-"), |id| truncate(id, 24)),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let summary = state
            .summary()
            .iter()
            .map(|(s, n)| format!("{n} {s}"))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(output, "\nResources: {summary}");

        if !state.history.is_empty() {
            let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
            for entry in state.history.iter().rev().take(5) {
                let marker = if entry.success { "✓".green() } else { "✗".red() };
                let _ = writeln!(
                    output,
                    "     {marker} {} {} {} ({})",
                    entry.timestamp.format("%Y-%m-%d %H:%M"),
                    entry.operation,
                    entry.version.as_deref().unwrap_or("-"),
                    entry.resources.join(", ")
                );
            }
        }

        output
    }

    /// Formats what providers report for an environment's resources.
    #[must_use]
    pub fn format_observed(&self, environment: &str, resources: &[ObservedResource]) -> String {
        if let Some(structured) = self.structured(&DriftReport {
            environment,
            resources,
        }) {
            return structured;
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nEnvironment: {}", environment.bold());
        if resources.is_empty() {
            output.push_str("   No running resources recorded.\n");
            return output;
        }

        let rows: Vec<DriftRow> = resources
            .iter()
            .map(|resource| DriftRow {
                name: resource.name.clone(),
                provider: resource.provider.clone(),
                id: truncate(&resource.id, 24),
                status: resource.status.clone().unwrap_or_else(|| String::from("-")),
                drift: Self::format_drift(&resource.drift),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let drifted = resources.iter().filter(|r| r.drift.is_drifted()).count();
        if drifted == 0 {
            let _ = writeln!(output, "\n{} All {} resource(s) in sync", "✓".green(), resources.len());
        } else {
            let _ = writeln!(output, "\n{} {drifted} resource(s) drifted", "!".yellow());
        }
        output
    }

    /// Formats the configured environments.
    #[must_use]
    pub fn format_environments(&self, config: &DeployConfig) -> String {
        let summaries: Vec<EnvironmentSummary<'_>> = config
            .environments
            .iter()
            .map(|(name, env)| EnvironmentSummary {
                name,
                provider: env.provider.as_deref(),
                region: env.region.as_deref(),
                resources: env.resources.len(),
                tags: &env.tags,
            })
            .collect();

        if let Some(structured) = self.structured(&summaries) {
            return structured;
        }

        let rows: Vec<EnvironmentRow> = summaries
            .iter()
            .map(|s| EnvironmentRow {
                name: s.name.to_string(),
                provider: s.provider.unwrap_or("-").to_string(),
                region: s.region.unwrap_or("-").to_string(),
                resources: s.resources,
                tags: s
                    .tags
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(", "),
            })
            .collect();

        format!("{}\n", Table::new(rows))
    }

    /// Formats a validation report.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult) -> String {
        if let Some(structured) = self.structured(result) {
            return structured;
        }

        let mut output = String::new();
        if result.is_valid() {
            let _ = writeln!(output, "{} Configuration is valid", "✓".green());
        } else {
            let _ = writeln!(output, "{} {} error(s):", "✗".red(), result.error_count());
            for error in &result.errors {
                let _ = writeln!(output, "   - {}: {}", error.field, error.message);
            }
        }

        if !result.warnings.is_empty() {
            let _ = writeln!(output, "\n{} {} warning(s):", "⚠".yellow(), result.warning_count());
            for warning in &result.warnings {
                let _ = writeln!(output, "   - {warning}");
            }
        }

        output
    }

    /// Formats the result of an unlock request.
    #[must_use]
    pub fn format_unlock(&self, environment: &str, lock: Option<&LockInfo>) -> String {
        let report = LockReport {
            environment,
            released: lock.is_some(),
            lock,
        };
        if let Some(structured) = self.structured(&report) {
            return structured;
        }

        lock.map_or_else(
            || format!("Environment '{environment}' is not locked.\n"),
            |lock| {
                format!(
                    "{} Released lock of '{environment}' held by {} since {}\n",
                    "✓".green(),
                    lock.holder,
                    lock.time.format("%Y-%m-%d %H:%M:%S UTC")
                )
            },
        )
    }

    /// Formats the location of a written backup.
    #[must_use]
    pub fn format_backup(&self, environment: &str, path: &Path) -> String {
        self.structured(&BackupReport { environment, path })
            .unwrap_or_else(|| format!("{} Backup of '{environment}' written to {}\n", "✓".green(), path.display()))
    }

    fn format_drift(drift: &Drift) -> String {
        match drift {
            Drift::InSync => "in sync".green().to_string(),
            Drift::Missing => "missing".red().to_string(),
            Drift::Changed { changes } => {
                let keys: Vec<&str> = changes.iter().map(|c| c.key.as_str()).collect();
                format!("changed: {}", keys.join(", ")).yellow().to_string()
            }
            Drift::Unreachable { message } => format!("unreachable: {}", truncate(message, 40))
                .red()
                .to_string(),
        }
    }

    fn format_action(action: ChangeAction) -> String {
        let label = format!("{}{action}", action.symbol());
        match action {
            ChangeAction::Create => label.green().to_string(),
            ChangeAction::Update => label.yellow().to_string(),
            ChangeAction::Delete => label.red().to_string(),
        }
    }

    fn format_resource_state(state: ResourceState) -> String {
        let label = state.to_string();
        match state {
            ResourceState::Running => label.green().to_string(),
            ResourceState::Pending | ResourceState::Creating => label.yellow().to_string(),
            ResourceState::Failed => label.red().to_string(),
            ResourceState::Deleted => label.dimmed().to_string(),
        }
    }
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Truncates a string to at most `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceSpec;
    use crate::planner::Planner;

    fn staging_plan() -> Plan {
        let desired = vec![
            ResourceSpec::new("db", "database", "local").with_property("engine", "postgres"),
            ResourceSpec::new("web", "instance", "local")
                .with_property("image", "web:1")
                .with_dependency("db"),
        ];
        Planner::new()
            .diff(&State::new("staging"), &desired)
            .expect("plan")
    }

    #[test]
    fn test_plan_text() {
        colored::control::set_override(false);
        let output = OutputFormatter::new(OutputFormat::Text).format_plan(&staging_plan());

        assert!(output.contains("Plan for 'staging'"));
        assert!(output.contains("+create"));
        assert!(output.contains("2 to add, 0 to update, 0 to delete"));
    }

    #[test]
    fn test_plan_json() {
        let output = OutputFormatter::new(OutputFormat::Json).format_plan(&staging_plan());
        let value: serde_json::Value = serde_json::from_str(&output).expect("valid json");

        assert_eq!(value["environment"], "staging");
        assert_eq!(value["add_resources"][0]["name"], "db");
        assert_eq!(value["add_resources"][1]["name"], "web");
    }

    #[test]
    fn test_state_yaml() {
        let output = OutputFormatter::new(OutputFormat::Yaml).format_state(&State::new("prod"));
        assert!(output.contains("environment: prod"));
    }

    #[test]
    fn test_unlock_text() {
        colored::control::set_override(false);
        let formatter = OutputFormatter::new(OutputFormat::Text);
        assert!(formatter.format_unlock("prod", None).contains("not locked"));

        let lock = LockInfo::new("ci-runner");
        assert!(formatter.format_unlock("prod", Some(&lock)).contains("ci-runner"));
    }

    #[test]
    fn test_observed_text_and_json() {
        colored::control::set_override(false);
        let resources = vec![
            ObservedResource {
                name: String::from("db"),
                id: String::from("database-1"),
                provider: String::from("local"),
                status: None,
                drift: Drift::Missing,
            },
            ObservedResource {
                name: String::from("web"),
                id: String::from("instance-1"),
                provider: String::from("local"),
                status: Some(String::from("running")),
                drift: Drift::InSync,
            },
        ];

        let text = OutputFormatter::new(OutputFormat::Text).format_observed("prod", &resources);
        assert!(text.contains("missing"));
        assert!(text.contains("1 resource(s) drifted"));

        let json = OutputFormatter::new(OutputFormat::Json).format_observed("prod", &resources);
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
        assert_eq!(value["resources"][0]["drift"]["drift"], "missing");
        assert!(value["resources"][0].get("status").is_none());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-identifier", 10), "a-very-...");
    }
}
