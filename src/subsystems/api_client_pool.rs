// src/subsystems/api_client_pool.rs
//! Pooled outbound HTTP clients
//!
//! Every request passes three checks before it reaches the network:
//! the domain's circuit must be closed (or half-open), the domain's token
//! bucket must have a token, and a pooled client must become free within
//! the client-wait ceiling. The client goes back to the pool on every exit
//! path when its [`PooledClient`] guard drops.
//!
//! Outcome classification:
//!
//! | Outcome             | Circuit breaker | Counters              |
//! |---------------------|-----------------|-----------------------|
//! | 2xx / 3xx           | success         | `successful`          |
//! | 4xx                 | success         | none                  |
//! | 5xx                 | error           | `errors`              |
//! | transport / body    | error           | `errors`              |

use crate::admission::{AdmissionGate, CircuitBreaker, GatePermit, KeyedRateLimiter};
use crate::utils::config::ApiConfig;
use crate::utils::errors::{OrchestratorError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const RESOURCE: &str = "api client";

/// Per-domain rate when no global limit is configured
const DEFAULT_DOMAIN_RPS: f64 = 100.0;

/// Response of a pooled request
#[derive(Debug, Clone)]
pub struct RequestResult {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub duration: Duration,
}

/// Point-in-time API pool metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApiMetrics {
    pub total_requests: u64,
    pub successful: u64,
    pub errors: u64,
    pub rate_limited: u64,
    /// Percentage, 100 when nothing has been sent yet
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub available_clients: usize,
    pub pool_size: usize,
    pub open_circuits: usize,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    errors: AtomicU64,
    rate_limited: AtomicU64,
    latency_ns: AtomicU64,
    latency_samples: AtomicU64,
}

/// Pool of reusable HTTP clients
pub struct ApiClientPool {
    clients: Mutex<Vec<reqwest::Client>>,
    gate: AdmissionGate,
    pool_size: usize,
    client_wait: Duration,
    rate_limiters: KeyedRateLimiter,
    circuit_breaker: CircuitBreaker,
    counters: Counters,
    closed: AtomicBool,
}

/// A client checked out of the pool
struct PooledClient<'a> {
    client: Option<reqwest::Client>,
    home: &'a Mutex<Vec<reqwest::Client>>,
    _permit: GatePermit,
}

impl PooledClient<'_> {
    fn client(&self) -> Result<&reqwest::Client> {
        self.client
            .as_ref()
            .ok_or(OrchestratorError::ManagerClosed("api client pool"))
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.home.lock().push(client);
        }
    }
}

impl ApiClientPool {
    /// Pool of `max_connections` clients with default timeouts.
    ///
    /// `global_rps` of 0 means no global limit (100 rps per domain);
    /// otherwise each domain gets a tenth of it.
    pub fn new(max_connections: usize, global_rps: u32) -> Result<Self> {
        Self::from_config(&ApiConfig {
            max_connections,
            global_rps,
            ..ApiConfig::default()
        })
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(OrchestratorError::ValidationFailure(
                "api pool needs at least one client".to_string(),
            ));
        }

        let mut clients = Vec::with_capacity(config.max_connections);
        for _ in 0..config.max_connections {
            let client = reqwest::Client::builder()
                .timeout(config.request_timeout())
                .pool_max_idle_per_host(10)
                .pool_idle_timeout(Duration::from_secs(90))
                .build()
                .map_err(|e| {
                    OrchestratorError::ConfigError(format!("Failed to build HTTP client: {}", e))
                })?;
            clients.push(client);
        }

        let domain_rps = if config.global_rps > 0 {
            (config.global_rps as f64 / 10.0).max(1.0)
        } else {
            DEFAULT_DOMAIN_RPS
        };

        info!(
            "API client pool ready: {} clients, {} rps per domain",
            config.max_connections, domain_rps
        );

        Ok(Self {
            clients: Mutex::new(clients),
            gate: AdmissionGate::new(RESOURCE, config.max_connections),
            pool_size: config.max_connections,
            client_wait: config.client_wait(),
            rate_limiters: KeyedRateLimiter::new(domain_rps),
            circuit_breaker: CircuitBreaker::new(
                config.circuit_threshold,
                config.circuit_timeout(),
            ),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// Send a request through the pool
    pub async fn make_request(
        &self,
        cancel: &CancellationToken,
        method: Method,
        url: &str,
        body: Option<Bytes>,
    ) -> Result<RequestResult> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OrchestratorError::ManagerClosed("api client pool"));
        }

        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let domain = match domain_key(url) {
            Ok(domain) => domain,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        if !self.circuit_breaker.can_proceed(&domain) {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            return Err(OrchestratorError::CircuitOpen(domain));
        }

        if !self.rate_limiters.allow(&domain) {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            debug!("Rate limited request to {}", domain);
            return Err(OrchestratorError::RateLimited(domain));
        }

        let pooled = match self.checkout(cancel).await {
            Ok(pooled) => pooled,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let mut request = pooled.client()?.request(method.clone(), url);
        if let Some(body) = body {
            request = request.body(body);
        }

        debug!("{} {} via pooled client", method, url);

        let start = Instant::now();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(OrchestratorError::RequestFailed(
                "request cancelled".to_string(),
            )),
            response = send(request) => response,
        };
        let duration = start.elapsed();
        drop(pooled);

        self.counters
            .latency_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        self.counters.latency_samples.fetch_add(1, Ordering::Relaxed);

        let (status, headers, body) = match outcome {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Request to {} failed: {}", domain, e);
                self.circuit_breaker.record_error(&domain);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        if status >= 500 {
            warn!("{} returned {}", domain, status);
            self.circuit_breaker.record_error(&domain);
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        } else if status >= 400 {
            // the endpoint answered, so it is not a circuit failure
            self.circuit_breaker.record_success(&domain);
        } else {
            self.circuit_breaker.record_success(&domain);
            self.counters.successful.fetch_add(1, Ordering::Relaxed);
        }

        Ok(RequestResult {
            status,
            headers,
            body,
            duration,
        })
    }

    /// Override the token bucket rate for one domain
    pub fn set_rate_limit(&self, domain: impl Into<String>, rps: u32) {
        let domain = domain.into();
        debug!("Rate limit for {} set to {} rps", domain, rps);
        self.rate_limiters.set_rate(domain, rps as f64);
    }

    pub fn rate_limit(&self, domain: &str) -> f64 {
        self.rate_limiters.rate_for(domain)
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn metrics(&self) -> ApiMetrics {
        let total = self.counters.total.load(Ordering::Relaxed);
        let successful = self.counters.successful.load(Ordering::Relaxed);
        let samples = self.counters.latency_samples.load(Ordering::Relaxed);
        let latency_ns = self.counters.latency_ns.load(Ordering::Relaxed);

        ApiMetrics {
            total_requests: total,
            successful,
            errors: self.counters.errors.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            success_rate: percentage(successful, total),
            avg_latency_ms: if samples > 0 {
                latency_ns as f64 / samples as f64 / 1_000_000.0
            } else {
                0.0
            },
            available_clients: self.gate.available(),
            pool_size: self.pool_size,
            open_circuits: self.circuit_breaker.open_circuits(),
        }
    }

    /// Reject further requests. In-flight requests finish normally.
    pub fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Closing API client pool");
            self.gate.close();
        }
        Ok(())
    }

    async fn checkout(&self, cancel: &CancellationToken) -> Result<PooledClient<'_>> {
        let permit = self.gate.acquire(cancel, Some(self.client_wait)).await?;
        let client = self.clients.lock().pop();

        Ok(PooledClient {
            client,
            home: &self.clients,
            _permit: permit,
        })
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<(u16, HeaderMap, Bytes)> {
    let response = request
        .send()
        .await
        .map_err(|e| OrchestratorError::RequestFailed(e.to_string()))?;

    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response
        .bytes()
        .await
        .map_err(|e| OrchestratorError::RequestFailed(format!("Failed to read response: {}", e)))?;

    Ok((status, headers, body))
}

/// Host plus explicit port, e.g. `api.example.com` or `127.0.0.1:8080`
pub fn domain_key(url: &str) -> Result<String> {
    let parsed = Url::parse(url)
        .map_err(|e| OrchestratorError::ValidationFailure(format!("invalid URL {}: {}", url, e)))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| OrchestratorError::ValidationFailure(format!("URL has no host: {}", url)))?;

    Ok(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

pub(crate) fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}
