//! Error types for the orchestrator
//!
//! Every abort path names the specific failing service, fixture, or seed so
//! that CI logs are actionable without digging into captured output.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dependency cycle detected involving service '{service}'")]
    DependencyCycle { service: String },

    // === Startup Errors ===
    #[error("Service '{service}' did not become ready within {timeout_ms} ms")]
    ReadinessTimeout { service: String, timeout_ms: u64 },

    #[error("Run exceeded aggregate timeout of {0} ms")]
    AggregateTimeout(u64),

    // === Runtime Errors ===
    #[error("Critical service '{service}' crashed unexpectedly")]
    ProcessCrash { service: String },

    #[error("Run cancelled before completion")]
    Cancelled,

    // === Fixture Errors ===
    #[error("Conflicting fixtures for {method} {pattern}: defined in '{first}' and '{second}'")]
    FixtureConflict {
        method: String,
        pattern: String,
        first: String,
        second: String,
    },

    // === Seed Errors ===
    #[error("Seed step '{step}' failed: {reason}")]
    SeedFailure { step: String, reason: String },

    // === Test Runner Errors ===
    #[error("Test command timed out after {0} ms")]
    SubprocessTimeout(u64),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a seed failure error
    pub fn seed_failure(step: &str, reason: impl Into<String>) -> Self {
        Self::SeedFailure {
            step: step.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a file read error
    pub fn file_read(path: &std::path::Path, error: impl std::fmt::Display) -> Self {
        Self::FileRead {
            path: path.display().to_string(),
            error: error.to_string(),
        }
    }

    /// Process exit code for this error.
    ///
    /// `2` means the environment never became usable (configuration, cycle,
    /// readiness, seed, or crash failures); `3` means the run ran out of
    /// time. Exit codes `0` and `1` are reserved for test pass/fail and are
    /// produced from [`RunResult`](crate::runner::RunResult), not errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::AggregateTimeout(_) | Error::SubprocessTimeout(_) => 3,
            _ => 2,
        }
    }
}
