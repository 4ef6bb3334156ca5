// src/observability/mod.rs
//! Logging and metrics setup
//!
//! Pools keep their own counters; the health checks push each snapshot into
//! the global `metrics` recorder as gauges, which `/metrics` renders in the
//! Prometheus text format.

use crate::utils::config::LoggingConfig;
use crate::utils::errors::{OrchestratorError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| OrchestratorError::ConfigError(format!("invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        registry.with(fmt::layer().compact().with_target(true)).try_init()
    };

    installed.map_err(|e| OrchestratorError::ConfigError(format!("tracing already set: {}", e)))
}

/// Install the Prometheus recorder (idempotent)
pub fn init_metrics() -> Result<()> {
    PROMETHEUS
        .get_or_try_init(|| {
            PrometheusBuilder::new().install_recorder().map_err(|e| {
                OrchestratorError::ConfigError(format!("failed to install metrics recorder: {}", e))
            })
        })
        .map(|_| ())
}

/// Prometheus exposition text, empty when no recorder is installed
pub fn render_metrics() -> String {
    PROMETHEUS
        .get()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

/// Export every numeric field of a pool's metrics struct as
/// `orchestrator_subsystem_metric{subsystem, metric}`
pub fn publish_snapshot<T: Serialize>(subsystem: &str, snapshot: &T) {
    let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(snapshot) else {
        return;
    };

    for (name, value) in fields {
        if let Some(value) = value.as_f64() {
            metrics::gauge!(
                "orchestrator_subsystem_metric",
                "subsystem" => subsystem.to_string(),
                "metric" => name
            )
            .set(value);
        }
    }
}

/// Count one health evaluation per subsystem and status
pub fn record_health_check(subsystem: &str, status: &str) {
    metrics::counter!(
        "orchestrator_health_checks_total",
        "subsystem" => subsystem.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}
