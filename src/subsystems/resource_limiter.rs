// src/subsystems/resource_limiter.rs
//! Per process-type resource limits
//!
//! Provides the limits applied to each subprocess started by the
//! [`ProcessManager`](crate::subsystems::process_manager::ProcessManager):
//! - Memory ceiling (MB)
//! - CPU share (percentage of one core)
//! - Wall-clock timeout (seconds)

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Resource limits for one process type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in megabytes
    pub max_memory_mb: u64,

    /// CPU quota as percentage of one core
    /// Example: 50.0 = half a core
    pub max_cpu_percent: f64,

    /// Wall-clock limit after which the process is force-killed
    pub timeout_secs: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 256,
            max_cpu_percent: 50.0,
            timeout_secs: 300,
        }
    }
}

impl ResourceLimits {
    /// Tight limits for short-lived helpers
    pub fn strict() -> Self {
        Self {
            max_memory_mb: 128,
            max_cpu_percent: 25.0,
            timeout_secs: 30,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate resource limits
    pub fn validate(&self) -> Result<(), String> {
        if self.max_memory_mb == 0 {
            return Err("memory limit cannot be 0".to_string());
        }

        if self.max_cpu_percent <= 0.0 {
            return Err("CPU quota must be positive".to_string());
        }
        if self.max_cpu_percent > 400.0 {
            return Err("CPU quota cannot exceed 400% (4 cores)".to_string());
        }

        if self.timeout_secs == 0 {
            return Err("timeout cannot be 0".to_string());
        }

        Ok(())
    }
}

/// Registry of limits keyed by process type
pub struct ResourceLimiter {
    /// Limits for types without an override
    default_limits: ResourceLimits,

    overrides: RwLock<HashMap<String, ResourceLimits>>,
}

impl ResourceLimiter {
    /// Create a new resource limiter
    pub fn new(default_limits: ResourceLimits) -> Self {
        Self {
            default_limits,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Get default limits
    pub fn default_limits(&self) -> &ResourceLimits {
        &self.default_limits
    }

    /// Override the limits for a process type
    pub fn set_limit(&self, process_type: impl Into<String>, limits: ResourceLimits) {
        self.overrides.write().insert(process_type.into(), limits);
    }

    /// Limits for a process type, falling back to the defaults
    pub fn limit_for(&self, process_type: &str) -> ResourceLimits {
        self.overrides
            .read()
            .get(process_type)
            .cloned()
            .unwrap_or_else(|| self.default_limits.clone())
    }
}

impl Default for ResourceLimiter {
    fn default() -> Self {
        Self::new(ResourceLimits::default())
    }
}
