// src/health/mod.rs
//! System health: the aggregator and its HTTP adapter

pub mod aggregator;
pub mod server;

pub use aggregator::{
    HealthAggregator, HealthIssue, HealthReport, HealthStatus, IssueSeverity, PerformanceTargets,
    SubsystemHealth,
};
pub use server::HealthServer;
