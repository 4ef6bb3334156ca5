// src/health/aggregator.rs
//! Cross-pool health aggregation
//!
//! Every check fans out one task per pool, each turning that pool's metrics
//! snapshot into a [`SubsystemHealth`], and joins all of them before the
//! overall status is derived. Probes only read metrics; pool state is never
//! touched.

use crate::observability::{publish_snapshot, record_health_check};
use crate::subsystems::{ApiClientPool, BrowserPool, FileManager, NetworkCoordinator, ProcessManager};
use crate::utils::config::HealthConfig;
use crate::utils::errors::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Probe names, in report order
pub const SUBSYSTEMS: [&str; 5] = ["api", "file", "browser", "process", "network"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubsystemHealth {
    pub status: HealthStatus,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub utilization_percent: f64,
    /// The pool's metrics snapshot as JSON
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Warning,
    Critical,
}

/// One threshold violation
#[derive(Debug, Clone, Serialize)]
pub struct HealthIssue {
    pub subsystem: String,
    pub severity: IssueSeverity,
    pub message: String,
    pub metric: String,
    pub actual: f64,
    pub expected: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub subsystems: BTreeMap<String, SubsystemHealth>,
    pub issues: Vec<HealthIssue>,
}

/// Performance targets the checks are evaluated against
#[derive(Debug, Clone)]
pub struct PerformanceTargets {
    pub max_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub min_throughput: f64,
    /// Fraction, e.g. 0.001 for 0.1%
    pub max_error_rate: f64,
    pub availability_target: f64,
}

impl Default for PerformanceTargets {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

impl From<&HealthConfig> for PerformanceTargets {
    fn from(config: &HealthConfig) -> Self {
        Self {
            max_latency_ms: config.max_latency_ms,
            p95_latency_ms: config.p95_latency_ms,
            p99_latency_ms: config.p99_latency_ms,
            min_throughput: config.min_throughput,
            max_error_rate: config.max_error_rate,
            availability_target: config.availability_target,
        }
    }
}

impl PerformanceTargets {
    /// Status for one subsystem.
    ///
    /// Success rate first (`<80` unhealthy, `<98` degraded), then latency
    /// against P95, then utilization (`>90`, or `>70` with success `<99`).
    pub fn evaluate(&self, success_rate: f64, latency_ms: f64, utilization: f64) -> HealthStatus {
        if success_rate < 80.0 {
            return HealthStatus::Unhealthy;
        }
        if success_rate < 98.0 {
            return HealthStatus::Degraded;
        }

        if latency_ms > 0.0 && latency_ms > self.p95_latency_ms {
            return HealthStatus::Degraded;
        }

        if utilization > 90.0 || (utilization > 70.0 && success_rate < 99.0) {
            return HealthStatus::Degraded;
        }

        HealthStatus::Healthy
    }
}

/// Any unhealthy subsystem makes the whole system unhealthy; any degraded
/// one makes it degraded
pub fn overall_status<'a>(statuses: impl IntoIterator<Item = &'a HealthStatus>) -> HealthStatus {
    statuses
        .into_iter()
        .fold(HealthStatus::Healthy, |overall, status| match (overall, status) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        })
}

/// Result of one probe
struct Probe {
    name: &'static str,
    health: SubsystemHealth,
    issues: Vec<HealthIssue>,
}

/// Figures extracted from a pool snapshot
struct Reading {
    success_rate: f64,
    latency_ms: f64,
    utilization: f64,
    /// Fraction of operations that failed, if the pool counts them
    error_rate: Option<f64>,
    details: serde_json::Value,
}

/// Health aggregator over the five pools.
///
/// Pools are optional so an embedding application can wire only the ones
/// it runs; a missing pool is reported as unhealthy.
#[derive(Clone, Default)]
pub struct HealthAggregator {
    api: Option<Arc<ApiClientPool>>,
    file: Option<Arc<FileManager>>,
    browser: Option<Arc<BrowserPool>>,
    process: Option<Arc<ProcessManager>>,
    network: Option<Arc<NetworkCoordinator>>,
    targets: Arc<PerformanceTargets>,
    readiness_timeout: Duration,
}

impl HealthAggregator {
    pub fn new(targets: PerformanceTargets) -> Self {
        Self {
            targets: Arc::new(targets),
            readiness_timeout: Duration::from_millis(HealthConfig::default().readiness_timeout_ms),
            ..Self::default()
        }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(PerformanceTargets::from(config))
            .with_readiness_timeout(Duration::from_millis(config.readiness_timeout_ms))
    }

    pub fn with_api_pool(mut self, pool: Arc<ApiClientPool>) -> Self {
        self.api = Some(pool);
        self
    }

    pub fn with_file_manager(mut self, manager: Arc<FileManager>) -> Self {
        self.file = Some(manager);
        self
    }

    pub fn with_browser_pool(mut self, pool: Arc<BrowserPool>) -> Self {
        self.browser = Some(pool);
        self
    }

    pub fn with_process_manager(mut self, manager: Arc<ProcessManager>) -> Self {
        self.process = Some(manager);
        self
    }

    pub fn with_network_coordinator(mut self, coordinator: Arc<NetworkCoordinator>) -> Self {
        self.network = Some(coordinator);
        self
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    pub fn targets(&self) -> &PerformanceTargets {
        &self.targets
    }

    /// Probe every pool concurrently and wait for all of them
    pub async fn check_health(&self) -> HealthReport {
        let mut results = self.fan_out();
        let mut subsystems = BTreeMap::new();
        let mut issues = Vec::new();

        while let Some(probe) = results.recv().await {
            subsystems.insert(probe.name.to_string(), probe.health);
            issues.extend(probe.issues);
        }

        // a probe task that panicked never reported
        for name in SUBSYSTEMS {
            if !subsystems.contains_key(name) {
                let probe = unavailable(name, "health probe did not report");
                subsystems.insert(name.to_string(), probe.health);
                issues.extend(probe.issues);
            }
        }

        let overall = overall_status(subsystems.values().map(|health| &health.status));
        debug!("Health check complete: {}", overall.as_str());

        HealthReport {
            overall_status: overall,
            timestamp: Utc::now(),
            subsystems,
            issues,
        }
    }

    /// Health of a single pool by name (`api`, `file`, `browser`, `process`,
    /// `network`)
    pub fn check_subsystem(&self, name: &str) -> Result<SubsystemHealth> {
        let name = SUBSYSTEMS
            .into_iter()
            .find(|candidate| *candidate == name)
            .ok_or_else(|| OrchestratorError::not_found("subsystem", name))?;

        Ok(self.probe(name).health)
    }

    /// True once every probe has reported and none is unhealthy.
    ///
    /// Returns false as soon as one unhealthy probe arrives, or when the
    /// probes do not all report within the readiness timeout.
    pub async fn readiness(&self) -> bool {
        let mut results = self.fan_out();

        let verdict = tokio::time::timeout(self.readiness_timeout, async {
            let mut reported = 0;
            while let Some(probe) = results.recv().await {
                if probe.health.status == HealthStatus::Unhealthy {
                    debug!("Not ready: {} is unhealthy", probe.name);
                    return false;
                }
                reported += 1;
            }
            reported == SUBSYSTEMS.len()
        })
        .await;

        match verdict {
            Ok(ready) => ready,
            Err(_) => {
                warn!(
                    "Readiness probes did not finish within {:?}",
                    self.readiness_timeout
                );
                false
            }
        }
    }

    /// True when every pool is wired; never looks at pool health
    pub fn liveness(&self) -> bool {
        self.api.is_some()
            && self.file.is_some()
            && self.browser.is_some()
            && self.process.is_some()
            && self.network.is_some()
    }

    fn fan_out(&self) -> mpsc::Receiver<Probe> {
        let (tx, rx) = mpsc::channel(SUBSYSTEMS.len());

        for name in SUBSYSTEMS {
            let aggregator = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(aggregator.probe(name)).await;
            });
        }

        rx
    }

    fn probe(&self, name: &'static str) -> Probe {
        let reading = match name {
            "api" => self.api.as_deref().map(read_api),
            "file" => self.file.as_deref().map(read_file),
            "browser" => self.browser.as_deref().map(read_browser),
            "process" => self.process.as_deref().map(read_process),
            _ => self.network.as_deref().map(read_network),
        };

        let Some(reading) = reading else {
            return unavailable(name, "subsystem not configured");
        };

        let status = if name == "network" {
            HealthStatus::Healthy
        } else {
            self.targets
                .evaluate(reading.success_rate, reading.latency_ms, reading.utilization)
        };
        record_health_check(name, status.as_str());

        Probe {
            name,
            issues: self.issues_for(name, &reading),
            health: SubsystemHealth {
                status,
                success_rate: reading.success_rate,
                avg_latency_ms: reading.latency_ms,
                utilization_percent: reading.utilization,
                details: reading.details,
            },
        }
    }

    fn issues_for(&self, name: &str, reading: &Reading) -> Vec<HealthIssue> {
        let mut issues = Vec::new();

        if let Some(error_rate) = reading.error_rate {
            if error_rate > self.targets.max_error_rate {
                issues.push(HealthIssue {
                    subsystem: name.to_string(),
                    severity: IssueSeverity::Critical,
                    message: format!(
                        "Error rate {:.2}% exceeds target {:.2}%",
                        error_rate * 100.0,
                        self.targets.max_error_rate * 100.0
                    ),
                    metric: "error_rate".to_string(),
                    actual: error_rate,
                    expected: self.targets.max_error_rate,
                });
            }
        }

        if reading.latency_ms > self.targets.p95_latency_ms {
            issues.push(HealthIssue {
                subsystem: name.to_string(),
                severity: IssueSeverity::Warning,
                message: format!(
                    "Average latency {:.1}ms exceeds P95 target {:.1}ms",
                    reading.latency_ms, self.targets.p95_latency_ms
                ),
                metric: "avg_latency_ms".to_string(),
                actual: reading.latency_ms,
                expected: self.targets.p95_latency_ms,
            });
        }

        if reading.utilization > 90.0 {
            issues.push(HealthIssue {
                subsystem: name.to_string(),
                severity: IssueSeverity::Warning,
                message: format!("Utilization {:.0}% above 90%", reading.utilization),
                metric: "utilization_percent".to_string(),
                actual: reading.utilization,
                expected: 90.0,
            });
        }

        issues
    }
}

fn unavailable(name: &'static str, reason: &str) -> Probe {
    record_health_check(name, HealthStatus::Unhealthy.as_str());

    Probe {
        name,
        health: SubsystemHealth {
            status: HealthStatus::Unhealthy,
            success_rate: 0.0,
            avg_latency_ms: 0.0,
            utilization_percent: 0.0,
            details: serde_json::Value::Null,
        },
        issues: vec![HealthIssue {
            subsystem: name.to_string(),
            severity: IssueSeverity::Critical,
            message: reason.to_string(),
            metric: "available".to_string(),
            actual: 0.0,
            expected: 1.0,
        }],
    }
}

fn utilization(in_use: f64, capacity: f64) -> f64 {
    if capacity > 0.0 {
        in_use / capacity * 100.0
    } else {
        0.0
    }
}

fn error_fraction(errors: u64, total: u64) -> Option<f64> {
    (total > 0).then(|| errors as f64 / total as f64)
}

fn read_api(pool: &ApiClientPool) -> Reading {
    let metrics = pool.metrics();
    publish_snapshot("api", &metrics);

    Reading {
        success_rate: metrics.success_rate,
        latency_ms: metrics.avg_latency_ms,
        utilization: utilization(
            metrics.pool_size.saturating_sub(metrics.available_clients) as f64,
            metrics.pool_size as f64,
        ),
        error_rate: error_fraction(metrics.errors, metrics.total_requests),
        details: serde_json::to_value(&metrics).unwrap_or_default(),
    }
}

fn read_file(manager: &FileManager) -> Reading {
    let metrics = manager.metrics();
    publish_snapshot("file", &metrics);

    Reading {
        success_rate: metrics.success_rate,
        latency_ms: metrics.avg_latency_ms,
        utilization: utilization(metrics.current_concurrent as f64, metrics.max_concurrent as f64),
        error_rate: error_fraction(metrics.errors, metrics.total_operations),
        details: serde_json::to_value(&metrics).unwrap_or_default(),
    }
}

fn read_browser(pool: &BrowserPool) -> Reading {
    let metrics = pool.metrics();
    publish_snapshot("browser", &metrics);

    Reading {
        success_rate: metrics.launch_success_rate,
        latency_ms: 0.0,
        utilization: utilization(metrics.active_browsers as f64, metrics.max_browsers as f64),
        error_rate: error_fraction(
            metrics.failed_launches,
            metrics.successful_launches + metrics.failed_launches,
        ),
        details: serde_json::to_value(&metrics).unwrap_or_default(),
    }
}

fn read_process(manager: &ProcessManager) -> Reading {
    let metrics = manager.metrics();
    publish_snapshot("process", &metrics);

    Reading {
        success_rate: metrics.start_success_rate,
        latency_ms: 0.0,
        utilization: utilization(metrics.process_instances as f64, metrics.max_processes as f64),
        error_rate: error_fraction(
            metrics.failed_starts,
            metrics.successful_starts + metrics.failed_starts,
        ),
        details: serde_json::to_value(&metrics).unwrap_or_default(),
    }
}

fn read_network(coordinator: &NetworkCoordinator) -> Reading {
    let metrics = coordinator.metrics();
    publish_snapshot("network", &metrics);

    Reading {
        success_rate: 100.0,
        latency_ms: 0.0,
        utilization: 0.0,
        error_rate: None,
        details: serde_json::to_value(&metrics).unwrap_or_default(),
    }
}
