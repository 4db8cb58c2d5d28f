//! CLI dispatch and the `run` pipeline
//!
//! `run` wires the whole system together: load and validate configuration,
//! register every service (the mock API server included) with the
//! supervisor, start the graph, apply seeds, execute the external test
//! command, and tear everything down regardless of outcome.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use colored::Colorize;

use crate::commands::Commands;
use crate::common::{Error, Result};
use crate::config;
use crate::mock::{FixtureRegistry, MockApiServer};
use crate::runner::{RunResult, TestRunnerAdapter};
use crate::seed::{self, SeedRunner};
use crate::supervisor::{graph, ServiceSupervisor};

/// Dispatch a CLI command; the returned value is the process exit code
pub async fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Run {
            services,
            fixtures,
            seeds,
            timeout,
            mock_port,
            failure_seed,
            artifacts,
            test_command,
        } => {
            run(RunArgs {
                services,
                fixtures,
                seeds,
                timeout,
                mock_port,
                failure_seed,
                artifacts,
                test_command,
            })
            .await
        }
        Commands::Validate {
            services,
            fixtures,
            seeds,
        } => validate(&services, fixtures.as_deref(), seeds.as_deref()),
    }
}

struct RunArgs {
    services: PathBuf,
    fixtures: Option<PathBuf>,
    seeds: Option<PathBuf>,
    timeout: u64,
    mock_port: u16,
    failure_seed: Option<u64>,
    artifacts: Option<PathBuf>,
    test_command: Vec<String>,
}

async fn run(args: RunArgs) -> Result<i32> {
    // Everything config-shaped is loaded and validated before any process
    // spawns, so configuration mistakes leave no partial state behind.
    let specs = config::load_service_graph(&args.services)?;
    let registry = match &args.fixtures {
        Some(dir) => FixtureRegistry::load(dir)?,
        None => FixtureRegistry::empty(),
    };
    let seed_steps = match &args.seeds {
        Some(dir) => config::load_seed_steps(dir)?,
        None => Vec::new(),
    };

    let run_id = generate_run_id();
    let failure_seed = args.failure_seed.unwrap_or_else(|| hash_run_id(&run_id));
    let artifacts_dir = args
        .artifacts
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("orchestrate").join(&run_id));
    std::fs::create_dir_all(&artifacts_dir)?;

    println!(
        "\n{} {} ({} services, {} fixtures, {} seed steps)",
        "Run".blue().bold(),
        run_id.white().bold(),
        specs.len() + 1,
        registry.len(),
        seed_steps.len(),
    );

    let mut supervisor = ServiceSupervisor::new(&run_id);
    for spec in specs {
        supervisor.register(spec)?;
    }
    let mock = MockApiServer::bind(registry, failure_seed, args.mock_port).await?;
    supervisor.register_with_launcher(mock.service_spec(), mock.launcher())?;
    tracing::info!(url = %mock.base_url(), seed = failure_seed, "mock API server bound");

    let supervisor = Arc::new(supervisor);
    let budget = Duration::from_millis(args.timeout);
    let started_at = Instant::now();

    let outcome = run_pipeline(
        &supervisor,
        &mock,
        &seed_steps,
        &args.test_command,
        budget,
        started_at,
        &run_id,
        &artifacts_dir,
    )
    .await;

    // Teardown happens on every path; stop_all is idempotent so the abort
    // paths inside start_all and the crash monitor do not double-stop.
    supervisor.stop_all().await;
    capture_artifacts(&supervisor, &mock, &artifacts_dir);

    match outcome {
        Ok(result) => {
            print_summary(&result, &artifacts_dir);
            Ok(if result.passed { 0 } else { 1 })
        }
        Err(e) => {
            eprintln!(
                "\n{} {} (artifacts: {})",
                "✗".red().bold(),
                e,
                artifacts_dir.display()
            );
            Err(supervisor.resolve_cancelled(e))
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    supervisor: &Arc<ServiceSupervisor>,
    mock: &MockApiServer,
    seed_steps: &[config::SeedStep],
    test_command: &[String],
    budget: Duration,
    started_at: Instant,
    run_id: &str,
    artifacts_dir: &Path,
) -> Result<RunResult> {
    supervisor.start_all(budget).await?;
    println!("  {} environment ready", "✓".green());

    if !seed_steps.is_empty() {
        let remaining = remaining_budget(budget, started_at)?;
        let seed_runner = SeedRunner::new(seed::ledger_path(artifacts_dir))
            .with_env(shared_env(mock));
        let applied = tokio::time::timeout(remaining, seed_runner.apply(seed_steps, run_id))
            .await
            .map_err(|_| Error::AggregateTimeout(budget.as_millis() as u64))??;
        println!(
            "  {} seeds applied ({} of {} steps ran)",
            "✓".green(),
            applied,
            seed_steps.len()
        );
    }

    let remaining = remaining_budget(budget, started_at)?;
    let adapter = TestRunnerAdapter::new(shared_env(mock));
    let result = adapter
        .run(
            test_command,
            remaining,
            supervisor.cancel_signal(),
            Some(artifacts_dir),
        )
        .await;
    result.map_err(|e| supervisor.resolve_cancelled(e))
}

fn remaining_budget(budget: Duration, started_at: Instant) -> Result<Duration> {
    budget
        .checked_sub(started_at.elapsed())
        .filter(|d| !d.is_zero())
        .ok_or_else(|| Error::AggregateTimeout(budget.as_millis() as u64))
}

/// Environment shared by seed steps and the test subprocess
fn shared_env(mock: &MockApiServer) -> HashMap<String, String> {
    HashMap::from([("MOCK_API_URL".to_string(), mock.base_url())])
}

fn capture_artifacts(supervisor: &ServiceSupervisor, mock: &MockApiServer, dir: &Path) {
    let logs_dir = dir.join("logs");
    if let Err(e) = std::fs::create_dir_all(&logs_dir) {
        tracing::warn!("could not create log artifact directory: {}", e);
        return;
    }
    for name in supervisor.service_names() {
        let lines = supervisor.logs(&name);
        if lines.is_empty() {
            continue;
        }
        let path = logs_dir.join(format!("{}.log", name));
        if let Err(e) = std::fs::write(&path, lines.join("\n")) {
            tracing::warn!(service = %name, "could not write log artifact: {}", e);
        }
    }

    let unmatched = mock.unmatched_requests();
    if !unmatched.is_empty() {
        tracing::warn!(count = unmatched.len(), "requests matched no fixture");
        if let Ok(json) = serde_json::to_string_pretty(&unmatched) {
            let _ = std::fs::write(dir.join("unmatched-requests.json"), json);
        }
    }
}

fn print_summary(result: &RunResult, artifacts_dir: &Path) {
    if result.passed {
        println!("\n{} {}", "✓".green().bold(), "Tests Passed".green().bold());
    } else {
        println!(
            "\n{} {} (exit code {})",
            "✗".red().bold(),
            "Tests Failed".red().bold(),
            result.exit_code
        );
    }
    for flow in &result.flows {
        let mark = if flow.passed {
            "✓".green()
        } else {
            "✗".red()
        };
        println!("  {} {}", mark, flow.flow);
    }
    println!("  artifacts: {}", artifacts_dir.display().to_string().dimmed());
}

fn validate(
    services: &Path,
    fixtures: Option<&Path>,
    seeds: Option<&Path>,
) -> Result<i32> {
    let specs = config::load_service_graph(services)?;
    let nodes: Vec<graph::Node> = specs
        .iter()
        .map(|s| (s.name.clone(), s.depends_on.clone()))
        .collect();
    let order = graph::topo_order(&nodes)?;

    println!("{}", "Service start order:".cyan());
    for (i, name) in order.iter().enumerate() {
        println!("  {}. {}", i + 1, name);
    }

    if let Some(dir) = fixtures {
        let registry = FixtureRegistry::load(dir)?;
        println!("{} {} fixtures loaded, no conflicts", "✓".green(), registry.len());
    }
    if let Some(dir) = seeds {
        let steps = config::load_seed_steps(dir)?;
        println!("{} {} seed steps parsed", "✓".green(), steps.len());
    }
    println!("{} configuration is valid", "✓".green().bold());
    Ok(0)
}

fn generate_run_id() -> String {
    format!("run-{:08x}", rand::random::<u32>())
}

/// FNV-1a over the run id. The derivation must be stable across builds so
/// a logged RUN_ID reproduces the same failure-injection sequence.
fn hash_run_id(run_id: &str) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for byte in run_id.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
