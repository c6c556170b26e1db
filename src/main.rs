//! CLI Harness - runs scenario files against a CLI that starts a local host
//!
//! Each scenario runs in its own temporary workspace; the harness reports
//! which step failed and what the CLI printed.

use clap::Parser;
use harness::{cli, commands::Commands, common::logging};

#[derive(Parser)]
#[command(name = "harness", about = "Black-box scenario runner for host-starting CLIs")]
#[command(version, long_about = None)]
struct Cli {
    /// Log step progress at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_cli(cli.verbose);

    if let Err(e) = cli::dispatch(cli.command).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
