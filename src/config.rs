//! Per-queue configuration: concurrency cap, default timeout, default retry
//! cap, and the processing loop's poll interval. Connection configuration
//! for the distributed backend lives in `supervisor` instead — it has its
//! own validation and defaults per spec §4.7.

use serde::{Deserialize, Serialize};
use service_builder::builder;
use std::time::Duration;

/// Configuration for one named queue (spec §3 "Queue configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[builder]
pub struct QueueConfig {
    /// The queue's name; required, used as the storage partition key.
    #[builder(getter)]
    pub name: String,

    /// Maximum number of jobs this queue will run concurrently.
    #[builder(default = "4", getter)]
    pub concurrency: usize,

    /// Timeout applied to a job that doesn't specify its own, in milliseconds.
    #[builder(default = "30_000", getter)]
    pub default_timeout_ms: u64,

    /// Retry cap applied to a job that doesn't specify its own.
    #[builder(default = "3", getter)]
    pub default_max_retries: u32,

    /// How often the processing loop polls when idle or at capacity.
    #[builder(default = "Duration::from_millis(100)", getter)]
    pub poll_interval: Duration,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        QueueConfigBuilder::new()
            .name(name.into())
            .build()
            .expect("name is the only required field")
    }
}

impl QueueConfigBuilder {
    /// Fast polling, small concurrency, short timeouts — for local iteration.
    pub fn development(name: impl Into<String>) -> Self {
        QueueConfigBuilder::new()
            .name(name.into())
            .concurrency(2)
            .poll_interval(Duration::from_millis(50))
            .default_timeout_ms(10_000)
    }

    /// Conservative defaults for a long-running deployment.
    pub fn production(name: impl Into<String>) -> Self {
        QueueConfigBuilder::new()
            .name(name.into())
            .concurrency(16)
            .poll_interval(Duration::from_millis(250))
            .default_timeout_ms(60_000)
            .default_max_retries(5)
    }

    /// Minimal overhead, tight polling — for deterministic test suites.
    pub fn testing(name: impl Into<String>) -> Self {
        QueueConfigBuilder::new()
            .name(name.into())
            .concurrency(1)
            .poll_interval(Duration::from_millis(5))
            .default_timeout_ms(5_000)
            .default_max_retries(1)
    }
}
