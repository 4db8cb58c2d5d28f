//! Test-environment orchestrator CLI
//!
//! `orchestrate run` brings up the service graph, serves fixtures, applies
//! seeds, runs the external test command, and tears everything down. Exit
//! codes: 0 tests passed, 1 tests failed, 2 environment setup failed,
//! 3 run exceeded the aggregate timeout.

use clap::Parser;
use orchestrate::commands::Commands;
use orchestrate::{cli, common};

#[derive(Parser)]
#[command(name = "orchestrate", about = "Test-environment orchestrator")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    common::logging::init_cli();

    let cli = Cli::parse();

    match cli::dispatch(cli.command).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}
