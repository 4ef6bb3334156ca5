// src/utils/errors.rs
//! Error taxonomy for every pool in the orchestrator
//!
//! All pool operations return [`Result`]. None of these conditions panic;
//! capacity problems are reported so the caller can decide whether to retry.

use std::time::Duration;
use thiserror::Error;

/// Orchestrator error type
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No admission slot became free within the wait ceiling
    #[error("timed out after {waited:?} waiting for a {resource} slot")]
    AdmissionTimeout {
        resource: &'static str,
        waited: Duration,
    },

    /// The caller's cancellation token fired while waiting for a slot
    #[error("cancelled while waiting for a {0} slot")]
    AdmissionCancelled(&'static str),

    /// Circuit breaker is open for the endpoint
    #[error("circuit breaker open for domain: {0}")]
    CircuitOpen(String),

    /// Token bucket exhausted for the key
    #[error("rate limit exceeded for domain: {0}")]
    RateLimited(String),

    /// Unknown process, browser or tab id
    #[error("{kind} not found: {id}")]
    ResourceNotFound { kind: &'static str, id: String },

    /// OS-level start failure
    #[error("failed to launch {what}: {reason}")]
    LaunchFailure { what: String, reason: String },

    /// Input rejected before any resource was touched
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    /// Operation attempted after close()
    #[error("{0} is closed")]
    ManagerClosed(&'static str),

    /// Browser already holds its maximum number of tabs
    #[error("browser {browser_id} tab limit exceeded ({max_tabs} tabs)")]
    TabLimitExceeded { browser_id: String, max_tabs: usize },

    /// Host already holds its maximum number of connections
    #[error("connection limit exceeded for host {host}: {active}/{limit}")]
    ConnectionLimitExceeded {
        host: String,
        active: u64,
        limit: u64,
    },

    /// HTTP transport or body failure
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// DNS lookup failure or timeout
    #[error("DNS resolution failed for {host}: {reason}")]
    DnsResolution { host: String, reason: String },

    /// Signalling or waiting on a child process failed
    #[error("process control error: {0}")]
    ProcessControl(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// True for capacity conditions a caller may reasonably retry later
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            OrchestratorError::AdmissionTimeout { .. }
                | OrchestratorError::RateLimited(_)
                | OrchestratorError::CircuitOpen(_)
                | OrchestratorError::TabLimitExceeded { .. }
                | OrchestratorError::ConnectionLimitExceeded { .. }
        )
    }

    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        OrchestratorError::ResourceNotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<::config::ConfigError> for OrchestratorError {
    fn from(err: ::config::ConfigError) -> Self {
        OrchestratorError::ConfigError(err.to_string())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, OrchestratorError>;
