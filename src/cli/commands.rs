//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// envdeploy - Multi-environment deployment orchestrator.
#[derive(Parser, Debug)]
#[command(name = "envdeploy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "ENVDEPLOY_CONFIG")]
    pub config: Option<PathBuf>,

    /// State directory (overrides `state.path`).
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format.
    #[arg(short, long, global = true, value_enum, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Plan, confirm and apply changes to an environment.
    #[command(disable_version_flag = true)]
    Deploy {
        /// Environment to deploy.
        environment: String,

        /// Version label recorded in the deployment history.
        #[arg(long)]
        version: Option<String>,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        force: bool,

        /// Maximum concurrent provider operations.
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Time budget for execution (`90`, `90s`, `5m`, `1h`).
        #[arg(long, value_parser = parse_duration)]
        timeout: Option<Duration>,

        /// Leave partial changes in place instead of rolling back.
        #[arg(long)]
        no_rollback: bool,

        /// Do not write a state backup before executing.
        #[arg(long)]
        no_backup: bool,
    },

    /// Show the changes a deploy would make.
    Plan {
        /// Environment to plan.
        environment: String,
    },

    /// Show recorded state.
    Status {
        /// Environment (all environments when omitted).
        environment: Option<String>,

        /// Ask providers for each running resource and report drift
        #[arg(long)]
        refresh: bool,
    },

    /// Validate configuration, dependencies and provider schemas.
    Validate {
        /// Environment (all environments when omitted).
        environment: Option<String>,
    },

    /// List configured environments.
    List,

    /// Manage environment state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the state file of an environment.
    Show {
        /// Environment name.
        environment: String,
    },

    /// Release an environment lock.
    Unlock {
        /// Environment name.
        environment: String,

        /// Release the lock even if it is not stale.
        #[arg(long)]
        force: bool,
    },

    /// Write a backup copy of an environment's state.
    Backup {
        /// Environment name.
        environment: String,

        /// Backup destination (defaults to the backups directory).
        #[arg(long)]
        dest: Option<PathBuf>,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
    /// YAML output.
    Yaml,
}

/// Parses a duration given as plain seconds or with an `s`, `m` or `h` suffix.
///
/// # Errors
///
/// Returns a message for an empty, non-numeric or zero duration.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('s') => (&value[..value.len() - 1], 1),
        Some('m') => (&value[..value.len() - 1], 60),
        Some('h') => (&value[..value.len() - 1], 3600),
        _ => (value, 1),
    };

    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{value}', expected e.g. 90, 90s, 5m or 1h"))?;
    if amount == 0 {
        return Err(String::from("duration must be greater than zero"));
    }

    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("90s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("0").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_deploy_arguments() {
        let cli = Cli::try_parse_from([
            "envdeploy",
            "--output",
            "json",
            "deploy",
            "staging",
            "--version",
            "1.4.2",
            "--force",
            "--parallel",
            "4",
            "--timeout",
            "10m",
            "--no-rollback",
        ])
        .expect("parse");

        assert_eq!(cli.output, OutputFormat::Json);
        let Commands::Deploy {
            environment,
            version,
            force,
            parallel,
            timeout,
            no_rollback,
            no_backup,
        } = cli.command
        else {
            panic!("expected deploy");
        };
        assert_eq!(environment, "staging");
        assert_eq!(version.as_deref(), Some("1.4.2"));
        assert!(force);
        assert_eq!(parallel, Some(4));
        assert_eq!(timeout, Some(Duration::from_secs(600)));
        assert!(no_rollback);
        assert!(!no_backup);
    }

    #[test]
    fn test_state_subcommands() {
        let cli = Cli::try_parse_from(["envdeploy", "state", "unlock", "prod", "--force"]).expect("parse");
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Unlock { ref environment, force: true }
            } if environment == "prod"
        ));

        let cli = Cli::try_parse_from(["envdeploy", "status"]).expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Status { environment: None, refresh: false }
        ));

        let cli = Cli::try_parse_from(["envdeploy", "status", "prod", "--refresh"]).expect("parse");
        assert!(matches!(cli.command, Commands::Status { refresh: true, .. }));
    }
}
