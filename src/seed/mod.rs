//! Seed runner
//!
//! Applies idempotent data-seeding steps once the core services are ready.
//! Each `(runId, idempotencyKey)` pair is recorded in a JSON ledger after
//! the step's side effect completes, so re-running the same run applies
//! every step exactly once. On failure, steps already applied in the same
//! invocation are rolled back best-effort in reverse order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command as TokioCommand;

use crate::common::{Error, Result};
use crate::config::SeedStep;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    run_id: String,
    key: String,
    step: String,
}

/// Executes seed steps against a ready environment
pub struct SeedRunner {
    ledger_path: PathBuf,
    env: HashMap<String, String>,
}

impl SeedRunner {
    pub fn new(ledger_path: impl Into<PathBuf>) -> Self {
        Self {
            ledger_path: ledger_path.into(),
            env: HashMap::new(),
        }
    }

    /// Extra environment passed to every step (`RUN_ID` is always set)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Apply `steps` in ascending `order`, skipping any whose idempotency
    /// key was already recorded for `run_id`. Returns the number of steps
    /// whose side effect ran in this invocation.
    pub async fn apply(&self, steps: &[SeedStep], run_id: &str) -> Result<usize> {
        let mut ordered: Vec<&SeedStep> = steps.iter().collect();
        ordered.sort_by_key(|s| s.order);

        let mut ledger = self.load_ledger()?;
        let mut applied_now: Vec<&SeedStep> = Vec::new();

        for step in ordered {
            let already_applied = ledger
                .iter()
                .any(|e| e.run_id == run_id && e.key == step.idempotency_key);
            if already_applied {
                tracing::info!(step = %step.name, key = %step.idempotency_key, "seed step already applied, skipping");
                continue;
            }

            tracing::info!(step = %step.name, "applying seed step");
            if let Err(reason) = self.execute(&step.action, run_id).await {
                tracing::error!(step = %step.name, %reason, "seed step failed, rolling back");
                self.rollback(&applied_now, run_id).await;
                for rolled_back in &applied_now {
                    ledger.retain(|e| {
                        !(e.run_id == run_id && e.key == rolled_back.idempotency_key)
                    });
                }
                self.persist_ledger(&ledger)?;
                return Err(Error::seed_failure(&step.name, reason));
            }

            // Record only after the side effect has completed
            ledger.push(LedgerEntry {
                run_id: run_id.to_string(),
                key: step.idempotency_key.clone(),
                step: step.name.clone(),
            });
            self.persist_ledger(&ledger)?;
            applied_now.push(step);
        }

        Ok(applied_now.len())
    }

    /// Best-effort reverse-order rollback; failures are logged, not raised
    async fn rollback(&self, applied: &[&SeedStep], run_id: &str) {
        for step in applied.iter().rev() {
            let Some(rollback) = &step.rollback else {
                tracing::warn!(step = %step.name, "no rollback command, skipping");
                continue;
            };
            if let Err(reason) = self.execute(rollback, run_id).await {
                tracing::warn!(step = %step.name, %reason, "rollback failed");
            }
        }
    }

    async fn execute(&self, action: &str, run_id: &str) -> std::result::Result<(), String> {
        let output = TokioCommand::new("sh")
            .arg("-c")
            .arg(action)
            .envs(&self.env)
            .env("RUN_ID", run_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| format!("failed to execute: {}", e))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "exit code {:?}: {}",
                output.status.code(),
                stderr.trim()
            ))
        }
    }

    fn load_ledger(&self) -> Result<Vec<LedgerEntry>> {
        if !self.ledger_path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.ledger_path)
            .map_err(|e| Error::file_read(&self.ledger_path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    fn persist_ledger(&self, ledger: &[LedgerEntry]) -> Result<()> {
        if let Some(parent) = self.ledger_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(ledger)?;
        std::fs::write(&self.ledger_path, json)?;
        Ok(())
    }
}

/// Convenience for building a ledger path inside an artifacts directory
pub fn ledger_path(artifacts_dir: &Path) -> PathBuf {
    artifacts_dir.join("seed-ledger.json")
}
