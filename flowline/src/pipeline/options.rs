//! Tuning knobs for buffered stages and cooperative polling.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_MAX_QUEUE_DEPTH: usize = 10_000;
const DEFAULT_MAX_CONCURRENCY: usize = 5;
const DEFAULT_POLL_INTERVAL_MS: u64 = 5;

/// Configuration consumed by buffered stages and by every cooperative
/// sleep-and-retry loop in the engine.
///
/// One instance is shared by all stages of a pipeline, including the
/// stages of nested sub-pipelines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineOptions {
    /// Backpressure threshold: a buffered stage suspends producers once
    /// its queue holds this many requests. Must be positive.
    pub max_queue_depth: usize,

    /// Maximum concurrent in-flight `process` calls per buffered stage.
    /// Must be positive.
    pub max_concurrency: usize,

    /// Interval, in milliseconds, for every cooperative sleep/retry:
    /// queue polling, drain polling, monitor polling.
    pub poll_interval_ms: u64,
}

impl PipelineOptions {
    /// Creates options with the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the backpressure threshold.
    #[must_use]
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth.max(1);
        self
    }

    /// Sets the concurrent in-flight `process` call bound.
    #[must_use]
    pub fn with_max_concurrency(mut self, concurrency: usize) -> Self {
        self.max_concurrency = concurrency.max(1);
        self
    }

    /// Sets the cooperative polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis().try_into().unwrap_or(u64::MAX).max(1);
        self
    }

    /// The cooperative polling interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}
