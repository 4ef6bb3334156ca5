// src/admission/circuit_breaker.rs
//! Per-endpoint circuit breaker
//!
//! ```text
//!            errors >= threshold
//!   Closed ─────────────────────▶ Open
//!     ▲                            │  now - last_error > timeout
//!     │ 3 successes                ▼  (checked lazily in can_proceed)
//!     └──────────────────────── HalfOpen
//!                                  │ any error
//!                                  └──────────▶ Open
//! ```
//!
//! Endpoints that were never recorded are treated as closed.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Successes in half-open needed to close the circuit
pub const HALF_OPEN_SUCCESSES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct EndpointState {
    state: CircuitState,
    consecutive_errors: u32,
    last_error: Option<Instant>,
    half_open_successes: u32,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_errors: 0,
            last_error: None,
            half_open_successes: 0,
        }
    }
}

/// Circuit breaker keyed by endpoint
pub struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    endpoints: Mutex<HashMap<String, EndpointState>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            threshold,
            timeout,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a request to `endpoint` may go out.
    ///
    /// Moves an expired open circuit to half-open.
    pub fn can_proceed(&self, endpoint: &str) -> bool {
        let mut endpoints = self.endpoints.lock();
        let Some(entry) = endpoints.get_mut(endpoint) else {
            return true;
        };

        match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = entry
                    .last_error
                    .map(|at| at.elapsed() > self.timeout)
                    .unwrap_or(true);

                if expired {
                    info!("Circuit for {} half-open, allowing trial request", endpoint);
                    entry.state = CircuitState::HalfOpen;
                    entry.half_open_successes = 0;
                }
                expired
            }
        }
    }

    pub fn record_error(&self, endpoint: &str) {
        let mut endpoints = self.endpoints.lock();
        let entry = endpoints.entry(endpoint.to_string()).or_default();

        entry.last_error = Some(Instant::now());

        match entry.state {
            CircuitState::HalfOpen => {
                warn!("Trial request to {} failed, circuit re-opened", endpoint);
                entry.state = CircuitState::Open;
                entry.half_open_successes = 0;
                entry.consecutive_errors = 0;
            }
            CircuitState::Closed => {
                entry.consecutive_errors += 1;
                if entry.consecutive_errors >= self.threshold {
                    warn!(
                        "Circuit for {} opened after {} consecutive errors",
                        endpoint, entry.consecutive_errors
                    );
                    entry.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {
                entry.consecutive_errors += 1;
            }
        }
    }

    pub fn record_success(&self, endpoint: &str) {
        let mut endpoints = self.endpoints.lock();
        let Some(entry) = endpoints.get_mut(endpoint) else {
            return;
        };

        match entry.state {
            CircuitState::HalfOpen => {
                entry.half_open_successes += 1;
                if entry.half_open_successes >= HALF_OPEN_SUCCESSES {
                    info!("Circuit for {} closed", endpoint);
                    entry.state = CircuitState::Closed;
                    entry.consecutive_errors = 0;
                    entry.half_open_successes = 0;
                }
            }
            CircuitState::Closed => {
                entry.consecutive_errors = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Current state without triggering the half-open transition
    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.endpoints
            .lock()
            .get(endpoint)
            .map(|entry| entry.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Number of endpoints whose circuit is not closed
    pub fn open_circuits(&self) -> usize {
        self.endpoints
            .lock()
            .values()
            .filter(|entry| entry.state != CircuitState::Closed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tripped(timeout: Duration) -> CircuitBreaker {
        let breaker = CircuitBreaker::new(3, timeout);
        for _ in 0..3 {
            breaker.record_error("api.example.com");
        }
        breaker
    }

    #[test]
    fn test_unknown_endpoint_is_closed() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        assert!(breaker.can_proceed("never-seen.example.com"));
        assert_eq!(breaker.state("never-seen.example.com"), CircuitState::Closed);
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_error("api.example.com");
        breaker.record_error("api.example.com");
        assert!(breaker.can_proceed("api.example.com"));

        breaker.record_error("api.example.com");
        assert!(!breaker.can_proceed("api.example.com"));
        assert_eq!(breaker.state("api.example.com"), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_consecutive_errors() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_error("api.example.com");
        breaker.record_error("api.example.com");
        breaker.record_success("api.example.com");
        breaker.record_error("api.example.com");
        breaker.record_error("api.example.com");

        assert!(breaker.can_proceed("api.example.com"));
    }

    #[test]
    fn test_half_open_after_timeout() {
        let breaker = tripped(Duration::from_millis(20));
        assert!(!breaker.can_proceed("api.example.com"));

        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.can_proceed("api.example.com"));
        assert_eq!(breaker.state("api.example.com"), CircuitState::HalfOpen);
    }

    #[test]
    fn test_three_successes_close() {
        let breaker = tripped(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.can_proceed("api.example.com"));

        breaker.record_success("api.example.com");
        breaker.record_success("api.example.com");
        assert_eq!(breaker.state("api.example.com"), CircuitState::HalfOpen);

        breaker.record_success("api.example.com");
        assert_eq!(breaker.state("api.example.com"), CircuitState::Closed);
    }

    #[test]
    fn test_error_in_half_open_reopens() {
        let breaker = tripped(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.can_proceed("api.example.com"));

        breaker.record_success("api.example.com");
        breaker.record_error("api.example.com");
        assert_eq!(breaker.state("api.example.com"), CircuitState::Open);
        assert!(!breaker.can_proceed("api.example.com"));

        // the next cycle needs a full three successes again
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.can_proceed("api.example.com"));
        breaker.record_success("api.example.com");
        breaker.record_success("api.example.com");
        assert_eq!(breaker.state("api.example.com"), CircuitState::HalfOpen);
    }

    #[test]
    fn test_open_circuits_count() {
        let breaker = tripped(Duration::from_secs(30));
        breaker.record_error("other.example.com");
        assert_eq!(breaker.open_circuits(), 1);
    }
}
