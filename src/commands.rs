//! CLI command definitions
//!
//! Defines the clap commands for the orchestrator CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Bring up the environment, run the test command, tear everything down
    Run {
        /// Path to the service graph file (YAML)
        #[arg(long)]
        services: PathBuf,

        /// Directory of fixture files served by the mock API server
        #[arg(long)]
        fixtures: Option<PathBuf>,

        /// Directory of seed files applied once services are ready
        #[arg(long)]
        seeds: Option<PathBuf>,

        /// Aggregate run timeout in milliseconds
        #[arg(long, default_value_t = 600_000)]
        timeout: u64,

        /// Port for the mock API server (0 picks an ephemeral port)
        #[arg(long, default_value_t = 0)]
        mock_port: u16,

        /// Override the run-scoped seed for fixture failure injection
        #[arg(long)]
        failure_seed: Option<u64>,

        /// Directory for captured artifacts (service logs, seed ledger,
        /// unmatched requests); defaults to a per-run temp directory
        #[arg(long)]
        artifacts: Option<PathBuf>,

        /// External test command executed once the environment is ready
        #[arg(last = true, required = true)]
        test_command: Vec<String>,
    },

    /// Validate configuration and print the resolved start order without
    /// starting anything
    Validate {
        /// Path to the service graph file (YAML)
        #[arg(long)]
        services: PathBuf,

        /// Directory of fixture files to check for conflicts
        #[arg(long)]
        fixtures: Option<PathBuf>,

        /// Directory of seed files to parse
        #[arg(long)]
        seeds: Option<PathBuf>,
    },
}
