//! Snowflake-style 63-bit ID generation.
//!
//! Layout (high to low): 41 bits of milliseconds since a custom epoch,
//! 10 bits of worker ID, 12 bits of per-millisecond sequence. IDs from one
//! generator are strictly increasing; IDs from generators with distinct
//! worker IDs never collide.
//!
//! The worker ID is not ambient state: each process obtains a cluster
//! index from the coordinator's atomic counter at startup and threads the
//! resulting generator through its callers explicitly.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};

/// 2020-01-01T00:00:00Z — keeps 41 timestamp bits good until ~2089.
const CUSTOM_EPOCH_MS: i64 = 1_577_836_800_000;

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_WORKER: i64 = (1 << WORKER_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

/// Errors constructing an [`IdGenerator`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum IdError {
    #[error("worker id {0} exceeds the {MAX_WORKER} maximum")]
    WorkerOutOfRange(i64),
}

struct IdState {
    last_ms: i64,
    sequence: u16,
}

/// Monotonic 63-bit ID source for one process.
pub struct IdGenerator {
    worker_id: i64,
    clock: Arc<dyn Clock>,
    state: Mutex<IdState>,
}

impl IdGenerator {
    /// Build a generator for an explicit worker ID in `0..1024`.
    pub fn new(worker_id: i64) -> Result<Self, IdError> {
        Self::with_clock(worker_id, Arc::new(SystemClock))
    }

    /// Seed a generator from a coordinator-issued cluster index, taking
    /// `index mod 1024` as the worker bits.
    pub fn from_cluster_index(index: i64) -> Self {
        // The modulo makes range errors impossible.
        match Self::new(index.rem_euclid(MAX_WORKER + 1)) {
            Ok(generator) => generator,
            Err(_) => unreachable!("cluster index is reduced mod 1024"),
        }
    }

    pub fn with_clock(worker_id: i64, clock: Arc<dyn Clock>) -> Result<Self, IdError> {
        if !(0..=MAX_WORKER).contains(&worker_id) {
            return Err(IdError::WorkerOutOfRange(worker_id));
        }
        Ok(Self {
            worker_id,
            clock,
            state: Mutex::new(IdState {
                last_ms: 0,
                sequence: 0,
            }),
        })
    }

    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }

    /// Produce the next ID. Strictly greater than every ID previously
    /// returned by this generator, even across clock regressions (the
    /// generator then keeps counting on its own remembered millisecond).
    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock();
        let mut now = self.clock.now_millis();
        if now < state.last_ms {
            now = state.last_ms;
        }
        if now == state.last_ms {
            if state.sequence == MAX_SEQUENCE {
                // Sequence exhausted within one millisecond: borrow the
                // next one rather than spinning on the clock.
                now += 1;
                state.sequence = 0;
            } else {
                state.sequence += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        ((now - CUSTOM_EPOCH_MS) << (WORKER_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence as i64
    }
}
