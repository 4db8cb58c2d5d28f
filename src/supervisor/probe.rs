//! Readiness probes
//!
//! A probe repeatedly attempts a liveness check (TCP connect, HTTP GET, or
//! external command) with exponential backoff until it succeeds or the
//! descriptor's timeout elapses. Ordinary check failures never surface as
//! errors; only malformed descriptors do, and those are rejected before any
//! process is spawned.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Command as TokioCommand;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::common::{Error, Result};
use crate::config::{self, ProbeKind, ReadinessSpec};

use super::cancelled;

/// Backoff multiplier applied after every failed attempt
const BACKOFF_MULTIPLIER: f64 = 1.5;
/// Upper bound for the backoff interval
const BACKOFF_CAP: Duration = Duration::from_secs(5);
/// Bound on a single tcp/http attempt so a black-holed target cannot eat
/// the whole probe budget
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Pluggable liveness check for one service dependency
#[derive(Debug)]
pub struct ReadinessProbe {
    kind: ProbeKind,
    target: String,
    timeout: Duration,
    base_interval: Duration,
    client: Option<reqwest::Client>,
}

impl ReadinessProbe {
    /// Build a probe from a validated descriptor
    pub fn from_spec(service: &str, spec: &ReadinessSpec) -> Result<Self> {
        config::validate_readiness(service, spec)?;
        let client = match spec.kind {
            ProbeKind::Http => Some(
                reqwest::Client::builder()
                    .timeout(ATTEMPT_TIMEOUT)
                    .build()
                    .map_err(|e| Error::Internal(format!("http client: {}", e)))?,
            ),
            _ => None,
        };
        Ok(Self {
            kind: spec.kind,
            target: spec.target.clone(),
            timeout: Duration::from_millis(spec.timeout_ms),
            base_interval: Duration::from_millis(spec.poll_interval_ms),
            client,
        })
    }

    /// Poll until ready or the descriptor timeout elapses.
    ///
    /// Returns `Ok(true)` when ready, `Ok(false)` on timeout, and
    /// `Err(Cancelled)` only when the run-wide cancellation signal fires.
    pub async fn wait_ready(&self, cancel: watch::Receiver<bool>) -> Result<bool> {
        let deadline = Instant::now() + self.timeout;
        let mut interval = self.base_interval;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let attempt = tokio::time::timeout(remaining, self.attempt());
            tokio::select! {
                outcome = attempt => {
                    match outcome {
                        Ok(true) => return Ok(true),
                        Ok(false) => {}
                        Err(_) => return Ok(false),
                    }
                }
                _ = cancelled(cancel.clone()) => return Err(Error::Cancelled),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            tokio::select! {
                _ = tokio::time::sleep(interval.min(remaining)) => {}
                _ = cancelled(cancel.clone()) => return Err(Error::Cancelled),
            }
            interval = interval.mul_f64(BACKOFF_MULTIPLIER).min(BACKOFF_CAP);
        }
    }

    async fn attempt(&self) -> bool {
        match self.kind {
            ProbeKind::Tcp => {
                matches!(
                    tokio::time::timeout(ATTEMPT_TIMEOUT, TcpStream::connect(&self.target))
                        .await,
                    Ok(Ok(_))
                )
            }
            ProbeKind::Http => {
                let Some(client) = self.client.as_ref() else {
                    return false;
                };
                match client.get(&self.target).send().await {
                    Ok(resp) => {
                        let code = resp.status().as_u16();
                        (200..400).contains(&code)
                    }
                    Err(_) => false,
                }
            }
            ProbeKind::Command => {
                // Dropped mid-attempt when the probe budget expires; the
                // child must not outlive the check
                let status = TokioCommand::new("sh")
                    .arg("-c")
                    .arg(&self.target)
                    .stdin(std::process::Stdio::null())
                    .stdout(std::process::Stdio::null())
                    .stderr(std::process::Stdio::null())
                    .kill_on_drop(true)
                    .status()
                    .await;
                matches!(status, Ok(s) if s.success())
            }
        }
    }
}
