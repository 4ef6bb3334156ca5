// src/utils/config.rs
//! Orchestrator configuration
//!
//! Values are layered in this order (later wins):
//!
//! 1. Built-in defaults ([`OrchestratorConfig::default`])
//! 2. Optional config file (TOML, YAML or JSON, detected by extension)
//! 3. Environment variables, e.g. `ORCHESTRATOR__API__MAX_CONNECTIONS=64`

use crate::subsystems::resource_limiter::ResourceLimits;
use crate::utils::errors::{OrchestratorError, Result};
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "ORCHESTRATOR";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub api: ApiConfig,
    pub process: ProcessConfig,
    pub browser: BrowserConfig,
    pub network: NetworkConfig,
    pub file: FileConfig,
    pub health: HealthConfig,
}

/// Health HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    /// Emit JSON lines instead of the compact formatter
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// API client pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Number of pooled HTTP clients
    pub max_connections: usize,

    /// Global requests per second (0 = unlimited, 100 rps per domain)
    pub global_rps: u32,

    /// Ceiling on the wait for a pooled client
    pub client_wait_ms: u64,

    /// Per-request timeout applied by each client
    pub request_timeout_secs: u64,

    /// Consecutive failures before a domain's circuit opens
    pub circuit_threshold: u32,

    /// Time an open circuit waits before allowing a trial request
    pub circuit_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            max_connections: 32,
            global_rps: 0,
            client_wait_ms: 5_000,
            request_timeout_secs: 30,
            circuit_threshold: 5,
            circuit_timeout_secs: 30,
        }
    }
}

impl ApiConfig {
    pub fn client_wait(&self) -> Duration {
        Duration::from_millis(self.client_wait_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn circuit_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_timeout_secs)
    }
}

/// Process manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub max_processes: usize,

    /// Grace period used when the manager terminates processes on close
    pub graceful_timeout_ms: u64,

    /// Per process-type overrides of the default limits
    pub limits: HashMap<String, ResourceLimits>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_processes: 200,
            graceful_timeout_ms: 5_000,
            limits: HashMap::new(),
        }
    }
}

/// Browser pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub max_browsers: usize,
    pub max_tabs: usize,

    /// Browser executable; searched on PATH when unset
    pub binary: Option<String>,

    /// How long to poll the debugging port for the websocket endpoint
    pub discovery_timeout_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            max_browsers: 10,
            max_tabs: 50,
            binary: None,
            discovery_timeout_ms: 10_000,
        }
    }
}

/// Network coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bytes per second (0 = unlimited)
    pub max_bandwidth_bytes_per_sec: u64,
    pub dns_ttl_secs: u64,
    pub dns_max_entries: usize,
    pub default_connection_limit: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_bandwidth_bytes_per_sec: 0,
            dns_ttl_secs: 300,
            dns_max_entries: 1000,
            default_connection_limit: 100,
        }
    }
}

/// File manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub max_concurrent: usize,
    pub stream_buffer_size: usize,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 500,
            stream_buffer_size: 64 * 1024,
        }
    }
}

/// Health aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub max_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub min_throughput: f64,
    pub max_error_rate: f64,
    pub availability_target: f64,

    /// Deadline on the fan-out behind `/readiness`
    pub readiness_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_latency_ms: 100.0,
            p95_latency_ms: 50.0,
            p99_latency_ms: 150.0,
            min_throughput: 500_000.0,
            max_error_rate: 0.001,
            availability_target: 0.999,
            readiness_timeout_ms: 5_000,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            debug!("Loading configuration file {}", path);
            builder = builder.add_source(File::with_name(path).required(true));
        }

        let config: Self = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject capacities that would make a pool unusable
    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("api.max_connections", self.api.max_connections),
            ("process.max_processes", self.process.max_processes),
            ("browser.max_browsers", self.browser.max_browsers),
            ("browser.max_tabs", self.browser.max_tabs),
            ("file.max_concurrent", self.file.max_concurrent),
            ("network.dns_max_entries", self.network.dns_max_entries),
        ];

        for (name, value) in capacities {
            if value == 0 {
                return Err(OrchestratorError::ConfigError(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        for (process_type, limits) in &self.process.limits {
            limits.validate().map_err(|e| {
                OrchestratorError::ConfigError(format!("process.limits.{}: {}", process_type, e))
            })?;
        }

        Ok(())
    }
}
