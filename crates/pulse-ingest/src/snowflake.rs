//! Snowflake-style unique ids.
//!
//! Layout, most significant first: 41 bits of milliseconds since
//! [`EPOCH_MS`], 10 bits of worker id, 12 bits of per-millisecond sequence.

use std::sync::Arc;

use parking_lot::Mutex;
use pulse_metrics::{Clock, SystemClock};

use crate::error::{IngestError, Result};

/// 2024-01-01T00:00:00Z in Unix milliseconds.
pub const EPOCH_MS: i64 = 1_704_067_200_000;

/// Bits reserved for the worker id.
pub const WORKER_BITS: u32 = 10;

/// Bits reserved for the sequence.
pub const SEQUENCE_BITS: u32 = 12;

/// Largest valid worker id.
pub const MAX_WORKER_ID: u16 = (1 << WORKER_BITS) - 1;

const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;

/// Clock regressions up to this many milliseconds are absorbed.
pub const MAX_BACKWARD_MS: i64 = 5;

/// The parts of an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnowflakeParts {
    /// Unix milliseconds.
    pub timestamp_ms: i64,
    /// Worker that generated the id.
    pub worker_id: u16,
    /// Sequence within the millisecond.
    pub sequence: u16,
}

/// Splits an id into its parts.
#[must_use]
pub fn decompose(id: i64) -> SnowflakeParts {
    SnowflakeParts {
        timestamp_ms: (id >> (WORKER_BITS + SEQUENCE_BITS)) + EPOCH_MS,
        worker_id: ((id >> SEQUENCE_BITS) & i64::from(MAX_WORKER_ID)) as u16,
        sequence: (id & MAX_SEQUENCE) as u16,
    }
}

#[derive(Debug)]
struct State {
    last_ms: i64,
    sequence: i64,
}

/// Generates unique, roughly time-ordered ids for one worker.
pub struct SnowflakeGenerator {
    worker_id: u16,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl SnowflakeGenerator {
    /// Creates a generator on the system clock.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `worker_id` exceeds [`MAX_WORKER_ID`].
    pub fn new(worker_id: u16) -> Result<Self> {
        Self::with_clock(worker_id, Arc::new(SystemClock))
    }

    /// Creates a generator on `clock`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `worker_id` exceeds [`MAX_WORKER_ID`].
    pub fn with_clock(worker_id: u16, clock: Arc<dyn Clock>) -> Result<Self> {
        if worker_id > MAX_WORKER_ID {
            return Err(IngestError::InvalidConfig {
                reason: format!("worker id {worker_id} exceeds {MAX_WORKER_ID}"),
            });
        }
        Ok(Self {
            worker_id,
            clock,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        })
    }

    /// The worker id embedded in every id.
    #[must_use]
    pub fn worker_id(&self) -> u16 {
        self.worker_id
    }

    /// Returns the next id.
    ///
    /// A small clock regression keeps counting on the last timestamp; when a
    /// millisecond's sequence runs out the timestamp is advanced by one.
    ///
    /// # Errors
    ///
    /// Returns `ClockMovedBackwards` if the clock regressed by more than
    /// [`MAX_BACKWARD_MS`].
    pub fn next_id(&self) -> Result<i64> {
        let now = self.clock.now_millis().max(EPOCH_MS);
        let mut state = self.state.lock();

        if now < state.last_ms {
            let behind = state.last_ms - now;
            if behind > MAX_BACKWARD_MS {
                return Err(IngestError::ClockMovedBackwards { millis: behind });
            }
        }

        if now > state.last_ms {
            state.last_ms = now;
            state.sequence = 0;
        } else if state.sequence == MAX_SEQUENCE {
            state.last_ms += 1;
            state.sequence = 0;
        } else {
            state.sequence += 1;
        }

        Ok(((state.last_ms - EPOCH_MS) << (WORKER_BITS + SEQUENCE_BITS))
            | (i64::from(self.worker_id) << SEQUENCE_BITS)
            | state.sequence)
    }
}

impl std::fmt::Debug for SnowflakeGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowflakeGenerator")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}
