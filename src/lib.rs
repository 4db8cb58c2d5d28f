//! Test-environment orchestrator
//!
//! Brings up the auxiliary services an end-to-end mobile test suite depends
//! on (database, auth provider, mock API server), gates them on readiness
//! probes in dependency order, seeds data idempotently, runs the external
//! test tool, and tears everything down regardless of outcome.

pub mod cli;
pub mod commands;
pub mod common;
pub mod config;
pub mod mock;
pub mod runner;
pub mod seed;
pub mod supervisor;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use config::{FixtureDefinition, ProbeKind, ReadinessSpec, SeedStep, ServiceSpec};
