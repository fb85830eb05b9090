//! CLI module for envdeploy.
//!
//! This module provides the command-line interface for planning, deploying
//! and inspecting environments.

mod commands;
mod output;

pub use commands::{parse_duration, Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
