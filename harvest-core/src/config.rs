use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs for the traversal runtime.
///
/// All fields carry defaults so deployments only override what they need.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    /// Maximum number of batches executing at once across all connectors.
    pub worker_pool_size: usize,
    /// Cadence of the scheduler loop (ms).
    pub tick_interval_ms: u64,
    /// Largest batch handed to a connector, also used when load is unthrottled.
    pub max_batch_size: usize,
    /// Retry delay for schedules that do not carry one (ms).
    pub default_retry_delay_ms: u64,
    /// How long a restart waits for a cancelled batch to wind down (ms).
    pub cancel_grace_ms: u64,
    /// Upper bound on waiting for the worker pool to drain at shutdown (ms).
    pub shutdown_timeout_ms: u64,
    /// Minimum spacing between scheduler progress summaries (ms).
    pub log_interval_ms: u64,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            tick_interval_ms: 2_000,
            max_batch_size: 500,
            default_retry_delay_ms: 5 * 60 * 1_000,
            cancel_grace_ms: 5_000,
            shutdown_timeout_ms: 30_000,
            log_interval_ms: 60_000,
        }
    }
}

impl TraversalConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn default_retry_delay(&self) -> Duration {
        Duration::from_millis(self.default_retry_delay_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_millis(self.log_interval_ms)
    }
}
