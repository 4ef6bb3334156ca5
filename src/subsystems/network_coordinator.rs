// src/subsystems/network_coordinator.rs
//! Bandwidth, DNS and per-host connection coordination
//!
//! Unlike the other pools this one has no global admission gate:
//!
//! - **Bandwidth**: byte token bucket; callers reserve ahead and sleep off
//!   any debt, so concurrent callers queue behind each other
//! - **DNS cache**: TTL entries, cleared wholesale when full
//! - **Connections**: per-host counters, rejected (never queued) at the limit

use crate::utils::config::NetworkConfig;
use crate::utils::errors::{OrchestratorError, Result};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Ceiling on a single system lookup
const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte bucket holding at most one second of traffic
#[derive(Debug)]
struct BandwidthBucket {
    bytes_per_sec: u64,
    tokens: f64,
    last_refill: Instant,
}

impl BandwidthBucket {
    fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            tokens: bytes_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.bytes_per_sec as f64)
            .min(self.bytes_per_sec as f64);
        self.last_refill = now;
    }

    /// Take `bytes` now and return how long the caller must wait for them.
    /// A debt too large for a `Duration` saturates at `Duration::MAX`.
    fn reserve(&mut self, bytes: u64) -> Duration {
        self.refill();
        self.tokens -= bytes as f64;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-self.tokens / self.bytes_per_sec as f64)
                .unwrap_or(Duration::MAX)
        }
    }

    fn refund(&mut self, bytes: u64) {
        self.tokens = (self.tokens + bytes as f64).min(self.bytes_per_sec as f64);
    }
}

#[derive(Debug, Clone)]
struct DnsEntry {
    ips: Vec<IpAddr>,
    expires_at: Instant,
}

/// TTL cache of resolved addresses
pub struct DnsCache {
    entries: RwLock<HashMap<String, DnsEntry>>,
    ttl: RwLock<Duration>,
    max_entries: usize,
}

impl DnsCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: RwLock::new(ttl),
            max_entries,
        }
    }

    /// Addresses for `host` if cached and not yet expired
    pub fn get(&self, host: &str) -> Option<Vec<IpAddr>> {
        self.entries
            .read()
            .get(host)
            .filter(|entry| Instant::now() < entry.expires_at)
            .map(|entry| entry.ips.clone())
    }

    pub fn insert(&self, host: impl Into<String>, ips: Vec<IpAddr>) {
        let host = host.into();
        let expires_at = Instant::now() + *self.ttl.read();
        let mut entries = self.entries.write();

        if entries.len() >= self.max_entries && !entries.contains_key(&host) {
            debug!("DNS cache full ({} entries), clearing", entries.len());
            entries.clear();
        }

        entries.insert(host, DnsEntry { ips, expires_at });
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// TTL for entries inserted from now on
    pub fn set_ttl(&self, ttl: Duration) {
        *self.ttl.write() = ttl;
    }
}

#[derive(Debug, Default)]
struct ConnectionState {
    limits: HashMap<String, u64>,
    active: HashMap<String, u64>,
}

/// Point-in-time network metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkMetrics {
    pub bytes_processed: u64,
    pub requests_throttled: u64,
    pub dns_hits: u64,
    pub dns_misses: u64,
    pub dns_hit_rate: f64,
    pub dns_cache_size: usize,
    pub active_connections: u64,
    pub limited_connections: u64,
    /// 0 means unlimited
    pub bandwidth_limit_bytes: u64,
}

#[derive(Default)]
struct Counters {
    bytes_processed: AtomicU64,
    throttled: AtomicU64,
    dns_hits: AtomicU64,
    dns_misses: AtomicU64,
    limited: AtomicU64,
}

/// Network coordinator
pub struct NetworkCoordinator {
    bandwidth: Mutex<Option<BandwidthBucket>>,
    dns_cache: DnsCache,
    resolver: OnceCell<TokioAsyncResolver>,
    connections: Mutex<ConnectionState>,
    default_connection_limit: AtomicU64,
    counters: Counters,
    closed: AtomicBool,
}

impl NetworkCoordinator {
    /// Coordinator limited to `max_bandwidth` bytes per second (0 = unlimited)
    pub fn new(max_bandwidth: u64) -> Self {
        Self::from_config(&NetworkConfig {
            max_bandwidth_bytes_per_sec: max_bandwidth,
            ..NetworkConfig::default()
        })
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            bandwidth: Mutex::new(bucket_for(config.max_bandwidth_bytes_per_sec)),
            dns_cache: DnsCache::new(
                Duration::from_secs(config.dns_ttl_secs),
                config.dns_max_entries,
            ),
            resolver: OnceCell::new(),
            connections: Mutex::new(ConnectionState::default()),
            default_connection_limit: AtomicU64::new(config.default_connection_limit),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Wait until `bytes` fit in the bandwidth budget.
    ///
    /// Returns the delay that was applied. Cancelling the wait gives the
    /// reserved bytes back.
    pub async fn throttle_bandwidth(
        &self,
        cancel: &CancellationToken,
        bytes: u64,
    ) -> Result<Duration> {
        self.ensure_open()?;

        let delay = match self.bandwidth.lock().as_mut() {
            Some(bucket) => bucket.reserve(bytes),
            None => Duration::ZERO,
        };

        if !delay.is_zero() {
            self.counters.throttled.fetch_add(1, Ordering::Relaxed);
            debug!("Throttling {} bytes for {:?}", bytes, delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    if let Some(bucket) = self.bandwidth.lock().as_mut() {
                        bucket.refund(bytes);
                    }
                    return Err(OrchestratorError::AdmissionCancelled("bandwidth"));
                }
            }
        }

        self.counters
            .bytes_processed
            .fetch_add(bytes, Ordering::Relaxed);
        Ok(delay)
    }

    /// Resolve `host`, serving from the cache while the entry is fresh
    pub async fn resolve_host(
        &self,
        cancel: &CancellationToken,
        host: &str,
    ) -> Result<Vec<IpAddr>> {
        self.ensure_open()?;

        if let Some(ips) = self.dns_cache.get(host) {
            self.counters.dns_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(ips);
        }
        self.counters.dns_misses.fetch_add(1, Ordering::Relaxed);

        let resolver = self.resolver.get_or_init(system_resolver);
        let lookup = tokio::select! {
            lookup = tokio::time::timeout(DNS_TIMEOUT, resolver.lookup_ip(host)) => lookup,
            _ = cancel.cancelled() => return Err(OrchestratorError::AdmissionCancelled("dns")),
        };

        let ips: Vec<IpAddr> = match lookup {
            Ok(Ok(lookup)) => lookup.iter().collect(),
            Ok(Err(e)) => {
                return Err(OrchestratorError::DnsResolution {
                    host: host.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(OrchestratorError::DnsResolution {
                    host: host.to_string(),
                    reason: format!("timed out after {:?}", DNS_TIMEOUT),
                })
            }
        };

        debug!("Resolved {} to {:?}", host, ips);
        self.dns_cache.insert(host, ips.clone());
        Ok(ips)
    }

    /// Take a connection slot for `host`; fails immediately at the limit
    pub fn acquire_connection(&self, host: &str) -> Result<()> {
        self.ensure_open()?;

        let mut state = self.connections.lock();
        let limit = state
            .limits
            .get(host)
            .copied()
            .unwrap_or_else(|| self.default_connection_limit.load(Ordering::Relaxed));
        let active = state.active.get(host).copied().unwrap_or(0);

        if active >= limit {
            self.counters.limited.fetch_add(1, Ordering::Relaxed);
            return Err(OrchestratorError::ConnectionLimitExceeded {
                host: host.to_string(),
                active,
                limit,
            });
        }

        state.active.insert(host.to_string(), active + 1);
        Ok(())
    }

    /// Return a connection slot; never goes below zero
    pub fn release_connection(&self, host: &str) {
        let mut state = self.connections.lock();
        match state.active.get_mut(host) {
            Some(active) if *active > 1 => *active -= 1,
            Some(_) => {
                state.active.remove(host);
            }
            None => warn!("Release for {} without an active connection", host),
        }
    }

    pub fn active_connections(&self, host: &str) -> u64 {
        self.connections
            .lock()
            .active
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    pub fn connection_limit(&self, host: &str) -> u64 {
        self.connections
            .lock()
            .limits
            .get(host)
            .copied()
            .unwrap_or_else(|| self.default_connection_limit.load(Ordering::Relaxed))
    }

    pub fn set_connection_limit(&self, host: impl Into<String>, limit: u64) {
        self.connections.lock().limits.insert(host.into(), limit);
    }

    pub fn set_default_connection_limit(&self, limit: u64) {
        self.default_connection_limit.store(limit, Ordering::Relaxed);
    }

    /// Change the bandwidth limit (0 = unlimited); the bucket starts full
    pub fn set_bandwidth_limit(&self, bytes_per_sec: u64) {
        info!("Bandwidth limit set to {} B/s", bytes_per_sec);
        *self.bandwidth.lock() = bucket_for(bytes_per_sec);
    }

    pub fn dns_cache(&self) -> &DnsCache {
        &self.dns_cache
    }

    pub fn metrics(&self) -> NetworkMetrics {
        let hits = self.counters.dns_hits.load(Ordering::Relaxed);
        let misses = self.counters.dns_misses.load(Ordering::Relaxed);

        NetworkMetrics {
            bytes_processed: self.counters.bytes_processed.load(Ordering::Relaxed),
            requests_throttled: self.counters.throttled.load(Ordering::Relaxed),
            dns_hits: hits,
            dns_misses: misses,
            dns_hit_rate: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64 * 100.0
            },
            dns_cache_size: self.dns_cache.len(),
            active_connections: self.connections.lock().active.values().sum(),
            limited_connections: self.counters.limited.load(Ordering::Relaxed),
            bandwidth_limit_bytes: self
                .bandwidth
                .lock()
                .as_ref()
                .map(|bucket| bucket.bytes_per_sec)
                .unwrap_or(0),
        }
    }

    /// Drop cached state and reject further operations. Idempotent.
    pub fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Closing network coordinator");
            self.dns_cache.clear();
            self.connections.lock().active.clear();
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OrchestratorError::ManagerClosed("network coordinator"));
        }
        Ok(())
    }
}

fn bucket_for(bytes_per_sec: u64) -> Option<BandwidthBucket> {
    (bytes_per_sec > 0).then(|| BandwidthBucket::new(bytes_per_sec))
}

fn system_resolver() -> TokioAsyncResolver {
    TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
        warn!("System resolver config unavailable ({}), using defaults", e);
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
    })
}
