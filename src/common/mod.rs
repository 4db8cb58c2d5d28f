//! Common utilities shared across the orchestrator
//!
//! This module contains:
//! - Error types and result aliases
//! - Logging setup

pub mod error;
pub mod logging;

pub use error::{Error, Result};
