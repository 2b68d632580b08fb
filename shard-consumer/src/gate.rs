//! Bounds the number of records in flight between the transport and the
//! caller's handler, shared by every session of a consumer.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time;

use tokio::sync::Semaphore;

use crate::error::GateError;

struct GateState {
    semaphore: Semaphore,
    in_flight: AtomicUsize,
}

impl GateState {
    fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        // Decrement before handing permits back so the counter never overshoots.
        let previous = self.in_flight.fetch_sub(count, Ordering::AcqRel);
        self.semaphore.add_permits(count);
        metrics::gauge!("shard_consumer_in_flight_records").set((previous - count) as f64);
    }

    fn acquired(&self, count: usize) {
        let previous = self.in_flight.fetch_add(count, Ordering::AcqRel);
        metrics::gauge!("shard_consumer_in_flight_records").set((previous + count) as f64);
    }
}

/// A gate admitting at most `max_in_flight` records at a time.
///
/// Capacity is handed out in FIFO order: a large request waiting at the head
/// of the queue is not overtaken by smaller requests that arrived later.
#[derive(Clone)]
pub struct BackpressureGate {
    state: Arc<GateState>,
    max_in_flight: usize,
    admit_timeout: time::Duration,
}

impl BackpressureGate {
    pub fn new(max_in_flight: usize, admit_timeout: time::Duration) -> Self {
        let max_in_flight = max_in_flight.min(Semaphore::MAX_PERMITS);
        Self {
            state: Arc::new(GateState {
                semaphore: Semaphore::new(max_in_flight),
                in_flight: AtomicUsize::new(0),
            }),
            max_in_flight,
            admit_timeout,
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Number of records currently admitted and not yet released.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::Acquire)
    }

    /// Wait for capacity for `count` records.
    ///
    /// Fails with `GateError::BackpressureTimeout` when the capacity did not
    /// free up within the admit timeout. Nothing is admitted in that case.
    pub async fn admit(&self, count: usize) -> Result<InFlight, GateError> {
        let permits = self.permits_for(count)?;
        if permits == 0 {
            return Ok(self.token(0));
        }

        match tokio::time::timeout(
            self.admit_timeout,
            self.state.semaphore.acquire_many(permits),
        )
        .await
        {
            Ok(Ok(permit)) => {
                permit.forget();
                self.state.acquired(count);
                Ok(self.token(count))
            }
            Ok(Err(_)) => Err(GateError::Closed),
            Err(_) => Err(GateError::BackpressureTimeout {
                requested: count,
                waited: self.admit_timeout,
            }),
        }
    }

    /// Admit `count` records only if there is capacity right now.
    pub fn try_admit(&self, count: usize) -> Option<InFlight> {
        let permits = self.permits_for(count).ok()?;
        if permits == 0 {
            return Some(self.token(0));
        }

        let permit = self.state.semaphore.try_acquire_many(permits).ok()?;
        permit.forget();
        self.state.acquired(count);
        Some(self.token(count))
    }

    /// Stop admitting. Pending and future admits fail with `GateError::Closed`;
    /// capacity already handed out is still released normally.
    pub fn close(&self) {
        self.state.semaphore.close();
    }

    fn permits_for(&self, count: usize) -> Result<u32, GateError> {
        let oversized = GateError::Oversized {
            requested: count,
            max_in_flight: self.max_in_flight,
        };
        if count > self.max_in_flight {
            return Err(oversized);
        }
        u32::try_from(count).map_err(|_| oversized)
    }

    fn token(&self, count: usize) -> InFlight {
        InFlight {
            state: self.state.clone(),
            count,
        }
    }
}

/// Capacity held for a number of admitted records, released on drop.
///
/// Admission happens per push while release happens per batch, so tokens can
/// be split off record by record and merged into the batch that carries them.
pub struct InFlight {
    state: Arc<GateState>,
    count: usize,
}

impl InFlight {
    pub fn count(&self) -> usize {
        self.count
    }

    /// Move up to `count` records worth of capacity into a new token.
    pub fn split(&mut self, count: usize) -> InFlight {
        let count = count.min(self.count);
        self.count -= count;
        InFlight {
            state: self.state.clone(),
            count,
        }
    }

    /// Absorb the capacity held by `other`. Both must come from the same gate.
    pub fn merge(&mut self, mut other: InFlight) {
        debug_assert!(Arc::ptr_eq(&self.state, &other.state));
        self.count += other.count;
        other.count = 0;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.state.release(self.count);
    }
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InFlight({})", self.count)
    }
}
