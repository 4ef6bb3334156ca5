// src/admission/mod.rs
//! Admission primitives shared by the resource pools
//!
//! - **Gate**: fixed-capacity counting semaphore with cancellable acquire
//! - **Rate Limiter**: non-blocking float token buckets, optionally keyed
//! - **Circuit Breaker**: per-endpoint closed/open/half-open state machine
//!
//! # Composition
//!
//! ```text
//!   make_request(url)
//!        │
//!        ▼
//!   CircuitBreaker::can_proceed(domain) ──✗──▶ CircuitOpen
//!        │
//!        ▼
//!   KeyedRateLimiter::allow(domain) ──────✗──▶ RateLimited
//!        │
//!        ▼
//!   AdmissionGate::acquire(cancel, 5s) ───✗──▶ AdmissionTimeout / AdmissionCancelled
//!        │
//!        ▼
//!     request
//! ```
//!
//! None of these types log on the hot path or publish metrics; the pools
//! layer that on top.

pub mod circuit_breaker;
pub mod gate;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use gate::{AdmissionGate, GatePermit};
pub use rate_limiter::{KeyedRateLimiter, TokenBucket};
