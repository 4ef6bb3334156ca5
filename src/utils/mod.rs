// src/utils/mod.rs
//! Shared utilities: error types and configuration

pub mod config;
pub mod errors;

pub use self::config::OrchestratorConfig;
pub use self::errors::{OrchestratorError, Result};
