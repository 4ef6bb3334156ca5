// src/subsystems/mod.rs
//! Resource pools
//!
//! Each pool owns one kind of scarce resource and admits callers through an
//! [`AdmissionGate`](crate::admission::AdmissionGate):
//!
//! ```text
//!                 ┌─────────────────────┐
//!  HTTP calls ───▶│ ApiClientPool       │──▶ reqwest clients
//!                 ├─────────────────────┤
//!  commands ─────▶│ ProcessManager      │──▶ OS child processes
//!                 ├─────────────────────┤
//!  pages ────────▶│ BrowserPool         │──▶ Chrome instances / tabs
//!                 ├─────────────────────┤
//!  bytes, DNS ───▶│ NetworkCoordinator  │──▶ bandwidth, resolver, sockets
//!                 ├─────────────────────┤
//!  paths ────────▶│ FileManager         │──▶ open files
//!                 └─────────────────────┘
//!                           │ metrics()
//!                           ▼
//!                   HealthAggregator
//! ```

pub mod api_client_pool;
pub mod browser_pool;
pub mod file_manager;
pub mod network_coordinator;
pub mod process_manager;
pub mod resource_limiter;

pub use api_client_pool::{ApiClientPool, ApiMetrics, RequestResult};
pub use browser_pool::{
    BrowserInstance, BrowserLauncher, BrowserMetrics, BrowserPool, ChromeLauncher, Tab,
};
pub use file_manager::{FileManager, FileMetrics, FileOperation, FileOperationKind, FileResult};
pub use network_coordinator::{DnsCache, NetworkCoordinator, NetworkMetrics};
pub use process_manager::{ProcessInstance, ProcessManager, ProcessMetrics, ProcessState};
pub use resource_limiter::{ResourceLimiter, ResourceLimits};
