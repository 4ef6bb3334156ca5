// src/admission/gate.rs
//! Fixed-capacity admission gate
//!
//! A counting semaphore shared by every pool. A [`GatePermit`] is the token:
//! dropping it returns the slot, so each successful acquire is released
//! exactly once, including on error paths.

use crate::utils::errors::{OrchestratorError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Counting semaphore with cancellable, optionally bounded acquire
#[derive(Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,

    /// Resource name used in error messages
    resource: &'static str,
}

/// One admission slot; released on drop
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    /// Create a gate with `capacity` slots
    pub fn new(resource: &'static str, capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            resource,
        }
    }

    /// Wait for a slot.
    ///
    /// Returns `AdmissionCancelled` if `cancel` fires first, `AdmissionTimeout`
    /// if `timeout` elapses first and `ManagerClosed` once the gate is closed.
    /// Without a timeout the wait is bounded only by `cancel`.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<GatePermit> {
        let deadline = async {
            match timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(OrchestratorError::AdmissionCancelled(self.resource)),

            permit = Arc::clone(&self.semaphore).acquire_owned() => permit
                .map(|permit| GatePermit { _permit: permit })
                .map_err(|_| OrchestratorError::ManagerClosed(self.resource)),

            _ = deadline => Err(OrchestratorError::AdmissionTimeout {
                resource: self.resource,
                waited: timeout.unwrap_or_default(),
            }),
        }
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<GatePermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| GatePermit { _permit: permit })
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fail all pending and future acquires; held permits still drop normally
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}
