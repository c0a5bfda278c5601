//! Load-based admission control for traversal batches.
//!
//! Each connector owns one [`HostLoadManager`]. The manager turns the
//! schedule's documents-per-minute budget and the time since the previous
//! batch finished into the largest batch that keeps the sustained rate under
//! that budget.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MILLIS_PER_MINUTE: i64 = 60_000;

/// Admissible batch size. `maximum == 0` means "do not run now".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSize {
    pub minimum: usize,
    pub maximum: usize,
}

impl BatchSize {
    pub const ZERO: BatchSize = BatchSize {
        minimum: 0,
        maximum: 0,
    };

    pub fn up_to(maximum: usize) -> Self {
        Self {
            minimum: maximum.min(1),
            maximum,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.maximum == 0
    }
}

#[derive(Debug)]
struct LoadState {
    load: u32,
    last_batch_end: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct HostLoadManager {
    max_batch_size: usize,
    state: Mutex<LoadState>,
}

impl HostLoadManager {
    pub fn new(load: u32, max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            state: Mutex::new(LoadState {
                load,
                last_batch_end: None,
            }),
        }
    }

    pub fn load(&self) -> u32 {
        self.lock().load
    }

    /// Updates the rate limit. The last-batch-end timestamp is kept, so a
    /// load change takes effect from the previous batch's end.
    pub fn set_load(&self, load: u32) {
        self.lock().load = load;
    }

    pub fn record_batch_end(&self, at: DateTime<Utc>) {
        self.lock().last_batch_end = Some(at);
    }

    pub fn last_batch_end(&self) -> Option<DateTime<Utc>> {
        self.lock().last_batch_end
    }

    /// Number of documents that may be traversed at `now`.
    ///
    /// A load of zero is unthrottled and always admits the default batch
    /// size, as does a connector that has not finished a batch yet.
    pub fn determine_batch_size(&self, now: DateTime<Utc>) -> BatchSize {
        let state = self.lock();
        if state.load == 0 {
            return BatchSize::up_to(self.max_batch_size);
        }
        let Some(last_end) = state.last_batch_end else {
            return BatchSize::up_to(self.max_batch_size);
        };

        let elapsed_ms = (now - last_end).num_milliseconds().max(0);
        let allowance = elapsed_ms
            .saturating_mul(i64::from(state.load))
            / MILLIS_PER_MINUTE;
        let allowance = usize::try_from(allowance).unwrap_or(usize::MAX);

        if allowance == 0 {
            BatchSize::ZERO
        } else {
            BatchSize::up_to(allowance.min(self.max_batch_size))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
