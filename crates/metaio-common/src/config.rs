//! Configuration for the MetaIO pipeline
//!
//! Everything here is supplied once at construction; the pipeline never
//! mutates it at runtime.

use crate::error::{Error, Result};
use crate::types::{DEFAULT_PAGE_SIZE, FileClass, IoDirection, PAGE_CONTROL_INFO_SIZE, Priority};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shortest accepted telemetry publish interval
pub const MIN_METRIC_INTERVAL_MS: u64 = 10;

/// Pipeline configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaIoConfig {
    /// Metadata page size in bytes, control area included
    pub page_size: usize,
    /// Number of read page units
    pub read_pool_capacity: usize,
    /// Number of write page units
    pub write_pool_capacity: usize,
    /// Maximum number of cache-resident write page units
    pub write_cache_capacity: usize,
    /// Maximum number of requests in flight at once
    pub orchestrator_pool_capacity: usize,
    /// Request queue weights, indexed by `FileClass`
    pub request_weights: Vec<u32>,
    /// Completion queue weights, indexed by `Priority`
    pub completion_weights: Vec<u32>,
    /// Telemetry publish interval in milliseconds
    pub metric_interval_ms: u64,
    /// Take one latency sample every N completions
    pub sampling_skip_count: u64,
    /// Local resubmissions when the storage layer reports busy
    pub max_submit_retries: u32,
    /// Fail a request after this many deferrals (None = never)
    pub backpressure_retry_limit: Option<u64>,
    /// Spins a sync waiter performs before parking
    pub sync_spin_count: u32,
    /// Empty polls a worker performs before yielding its core
    pub idle_spin_count: u32,
}

impl Default for MetaIoConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            read_pool_capacity: 32,
            write_pool_capacity: 32,
            write_cache_capacity: 32,
            orchestrator_pool_capacity: 32,
            // SpecialPurposeMap, Journal, Map, General
            request_weights: vec![8, 4, 2, 1],
            // Highest, Normal
            completion_weights: vec![4, 1],
            metric_interval_ms: 1000,
            sampling_skip_count: 100,
            max_submit_retries: 3,
            backpressure_retry_limit: None,
            sync_spin_count: 1000,
            idle_spin_count: 1000,
        }
    }
}

impl MetaIoConfig {
    /// Check that the configuration describes a usable pipeline
    pub fn validate(&self) -> Result<()> {
        if self.page_size <= PAGE_CONTROL_INFO_SIZE {
            return Err(Error::configuration(format!(
                "page size {} leaves no room for data after the {}-byte control area",
                self.page_size, PAGE_CONTROL_INFO_SIZE
            )));
        }
        if self.read_pool_capacity == 0 || self.write_pool_capacity == 0 {
            return Err(Error::configuration("page unit pools must not be empty"));
        }
        if self.orchestrator_pool_capacity == 0 {
            return Err(Error::configuration(
                "orchestrator pool capacity must be positive",
            ));
        }
        Self::check_weights("request", &self.request_weights, FileClass::COUNT)?;
        Self::check_weights("completion", &self.completion_weights, Priority::COUNT)?;
        if self.metric_interval_ms < MIN_METRIC_INTERVAL_MS {
            return Err(Error::configuration(format!(
                "metric interval {}ms is below the {}ms minimum",
                self.metric_interval_ms, MIN_METRIC_INTERVAL_MS
            )));
        }
        Ok(())
    }

    fn check_weights(name: &str, weights: &[u32], expected: usize) -> Result<()> {
        if weights.len() != expected {
            return Err(Error::configuration(format!(
                "{name} queue needs {expected} weights, got {}",
                weights.len()
            )));
        }
        if weights.contains(&0) {
            return Err(Error::configuration(format!(
                "{name} queue weights must be positive"
            )));
        }
        Ok(())
    }

    /// Bytes of file data carried by one page
    #[must_use]
    pub const fn data_chunk_size(&self) -> usize {
        self.page_size - PAGE_CONTROL_INFO_SIZE
    }

    /// Unit pool capacity for one direction
    #[must_use]
    pub const fn pool_capacity(&self, direction: IoDirection) -> usize {
        match direction {
            IoDirection::Read => self.read_pool_capacity,
            IoDirection::Write => self.write_pool_capacity,
        }
    }

    #[must_use]
    pub const fn metric_interval(&self) -> Duration {
        Duration::from_millis(self.metric_interval_ms)
    }
}
