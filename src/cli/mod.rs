//! CLI module for the converge tool.
//!
//! This module provides the command-line interface: argument definitions
//! and output formatting.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
