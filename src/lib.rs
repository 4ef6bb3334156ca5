// src/lib.rs
//! Resource Orchestrator Library
//!
//! Bounded-concurrency access to scarce external resources: outbound HTTP
//! clients, OS subprocesses, browser instances and tabs, network bandwidth,
//! DNS and host connections, and open files.
//!
//! # Architecture
//!
//! - **admission**: gate, token-bucket rate limiter, circuit breaker
//! - **subsystems**: one pool per resource class, each with a metrics snapshot
//! - **health**: concurrent health aggregation and its HTTP surface
//! - **observability**: tracing subscriber and Prometheus recorder
//! - **utils**: configuration and error types
//!
//! Every blocking call takes a [`CancellationToken`](tokio_util::sync::CancellationToken)
//! and every pool has an idempotent `close()`.

pub mod admission;
pub mod health;
pub mod observability;
pub mod subsystems;
pub mod utils;

// Re-export commonly used types
pub use admission::{AdmissionGate, CircuitBreaker, CircuitState, KeyedRateLimiter, TokenBucket};
pub use health::{HealthAggregator, HealthReport, HealthServer, HealthStatus, PerformanceTargets};
pub use subsystems::{
    ApiClientPool, BrowserPool, FileManager, FileOperation, NetworkCoordinator, ProcessManager,
    ProcessState, ResourceLimits,
};
pub use utils::config::OrchestratorConfig;
pub use utils::errors::{OrchestratorError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
