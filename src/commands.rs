//! CLI command definitions
//!
//! Defines the clap commands for the harness CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run scenario files against the CLI under test
    Run {
        /// Paths to YAML scenario files
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// CLI program to test (overrides the config file)
        #[arg(long)]
        cli: Option<String>,

        /// Configuration file (default: platform config dir)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of scenarios to run concurrently
        #[arg(long, short, default_value_t = 1)]
        jobs: usize,

        /// Keep every workspace, not only those of failed scenarios
        #[arg(long)]
        keep_workspace: bool,
    },

    /// Validate scenario files without running them
    Check {
        /// Paths to YAML scenario files
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}
