//! I/O statistics and telemetry publishing
//!
//! [`IoStatistics`] is shared by both pipeline halves and only uses
//! relaxed atomics, so recording never takes a lock. Latencies are
//! sampled: one completion in `sampling_skip_count` is recorded.
//!
//! # Published metrics
//!
//! - `metaio_issued_total{tier,direction}` - requests accepted per tier
//! - `metaio_class_issued_total{class,direction}` - requests per file class
//! - `metaio_completed_total{direction}` / `metaio_failed_total{direction}`
//! - `metaio_page_io_total{direction}` - page I/Os handed to storage
//! - `metaio_deferrals_total`, `metaio_build_stalls_total`,
//!   `metaio_submit_retries_total`, `metaio_merged_requests_total`,
//!   `metaio_cache_hits_total`
//! - `metaio_unit_hold_us{quantile}` - sampled allocate to release time
//! - `metaio_request_latency_us{quantile}` - sampled issue to complete time
//! - gauges: `metaio_orchestrators_free`, `metaio_units_free{kind}`,
//!   `metaio_units_used{kind}`, `metaio_cache_entries`,
//!   `metaio_cache_resident`, `metaio_request_queue_depth`,
//!   `metaio_completion_queue_depth`, `metaio_pending_requests`,
//!   `metaio_stalled_builds`

use crate::orchestrator::OrchestratorSummary;
use crate::unit::UnitKind;
use metaio_common::{FileClass, IoDirection, StorageTier};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Upper bucket bounds in microseconds; metadata pages mostly complete
/// in the low microseconds
const BUCKET_BOUNDS_US: [u64; 14] = [
    5,
    10,
    25,
    50,
    100,
    250,
    500,
    1_000,
    2_500,
    5_000,
    10_000,
    50_000,
    250_000,
    u64::MAX,
];

/// Bucketed latency histogram
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKET_BOUNDS_US.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyHistogram {
    pub fn record(&self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let bucket = BUCKET_BOUNDS_US
            .iter()
            .position(|&bound| us < bound)
            .unwrap_or(BUCKET_BOUNDS_US.len() - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn mean_us(&self) -> u64 {
        match self.count() {
            0 => 0,
            n => self.sum_us.load(Ordering::Relaxed) / n,
        }
    }

    #[must_use]
    pub fn max_us(&self) -> u64 {
        self.max_us.load(Ordering::Relaxed)
    }

    /// Upper bound of the bucket holding quantile `q` (0.0..=1.0)
    #[must_use]
    pub fn quantile_us(&self, q: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }
        let rank = ((total as f64) * q).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (bucket, bound) in self.buckets.iter().zip(BUCKET_BOUNDS_US) {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= rank {
                // The open-ended last bucket reports the observed maximum
                return if bound == u64::MAX { self.max_us() } else { bound };
            }
        }
        self.max_us()
    }
}

/// Point-in-time pool and queue occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineGauges {
    pub free_orchestrators: usize,
    pub active_orchestrators: usize,
    pub free_units: [usize; 2],
    pub used_units: [usize; 2],
    pub cache_entries: usize,
    pub cache_resident: usize,
    pub request_queue_depth: usize,
    pub completion_queue_depth: usize,
    pub pending_requests: usize,
    pub stalled_builds: usize,
}

/// One named, labelled value
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: &'static str,
    pub labels: Vec<(&'static str, String)>,
    pub value: f64,
}

/// Everything published in one telemetry round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSet {
    pub entries: Vec<Metric>,
}

impl MetricSet {
    fn push(&mut self, name: &'static str, labels: Vec<(&'static str, String)>, value: f64) {
        self.entries.push(Metric {
            name,
            labels,
            value,
        });
    }

    /// Value of the metric with exactly these labels
    #[must_use]
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.entries
            .iter()
            .find(|m| {
                m.name == name
                    && m.labels.len() == labels.len()
                    && m.labels
                        .iter()
                        .zip(labels)
                        .all(|((k, v), (lk, lv))| k == lk && v == lv)
            })
            .map(|m| m.value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Counters shared by the dispatcher and the completion processor
#[derive(Debug, Default)]
pub struct IoStatistics {
    issued_by_tier: [[AtomicU64; 2]; 3],
    issued_by_class: [[AtomicU64; 2]; FileClass::COUNT],
    completed: [AtomicU64; 2],
    failed: [AtomicU64; 2],
    page_ios: [AtomicU64; 2],
    deferrals: AtomicU64,
    stalls: AtomicU64,
    submit_retries: AtomicU64,
    merged: AtomicU64,
    cache_hits: AtomicU64,
    sampling_skip: u64,
    unit_ticks: AtomicU64,
    request_ticks: AtomicU64,
    unit_hold: LatencyHistogram,
    request_latency: LatencyHistogram,
}

impl IoStatistics {
    #[must_use]
    pub fn new(sampling_skip_count: u64) -> Self {
        Self {
            sampling_skip: sampling_skip_count.max(1),
            ..Self::default()
        }
    }

    fn sample(&self, ticks: &AtomicU64) -> bool {
        ticks.fetch_add(1, Ordering::Relaxed) % self.sampling_skip == 0
    }

    pub fn record_issue(&self, tier: StorageTier, class: FileClass, direction: IoDirection) {
        self.issued_by_tier[tier.index()][direction.index()].fetch_add(1, Ordering::Relaxed);
        self.issued_by_class[class.index()][direction.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page_io(&self, direction: IoDirection) {
        self.page_ios[direction.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferral(&self) {
        self.deferrals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_submit_retry(&self) {
        self.submit_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge(&self) {
        self.merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hits(&self, hits: u32) {
        if hits > 0 {
            self.cache_hits.fetch_add(u64::from(hits), Ordering::Relaxed);
        }
    }

    /// A unit went back to the pool after `held`
    pub fn record_unit_release(&self, held: Duration) {
        if self.sample(&self.unit_ticks) {
            self.unit_hold.record(held);
        }
    }

    /// A request failed without ever getting an orchestrator
    pub fn record_failure(&self, direction: IoDirection) {
        self.failed[direction.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// An orchestrator notified its requests
    pub fn record_completion(&self, summary: &OrchestratorSummary) {
        let direction = summary.direction.index();
        let requests = summary.requests as u64;
        if summary.error.is_some() {
            self.failed[direction].fetch_add(requests, Ordering::Relaxed);
        } else {
            self.completed[direction].fetch_add(requests, Ordering::Relaxed);
        }
        if self.sample(&self.request_ticks) {
            let issued = summary.submitted_at.unwrap_or(summary.created_at);
            self.request_latency.record(issued.elapsed());
        }
    }

    #[must_use]
    pub fn issued(&self, tier: StorageTier, direction: IoDirection) -> u64 {
        self.issued_by_tier[tier.index()][direction.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn issued_for_class(&self, class: FileClass, direction: IoDirection) -> u64 {
        self.issued_by_class[class.index()][direction.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn completed(&self, direction: IoDirection) -> u64 {
        self.completed[direction.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed(&self, direction: IoDirection) -> u64 {
        self.failed[direction.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn page_ios(&self, direction: IoDirection) -> u64 {
        self.page_ios[direction.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn deferrals(&self) -> u64 {
        self.deferrals.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn submit_retries(&self) -> u64 {
        self.submit_retries.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn merged(&self) -> u64 {
        self.merged.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn unit_hold(&self) -> &LatencyHistogram {
        &self.unit_hold
    }

    #[must_use]
    pub const fn request_latency(&self) -> &LatencyHistogram {
        &self.request_latency
    }

    /// Build the metric set for one publish round
    #[must_use]
    pub fn snapshot(&self, gauges: &PipelineGauges) -> MetricSet {
        let mut set = MetricSet::default();

        for tier in StorageTier::ALL {
            for direction in IoDirection::ALL {
                set.push(
                    "metaio_issued_total",
                    vec![
                        ("tier", tier.as_str().to_string()),
                        ("direction", direction.as_str().to_string()),
                    ],
                    self.issued(tier, direction) as f64,
                );
            }
        }
        for class in FileClass::ALL {
            for direction in IoDirection::ALL {
                set.push(
                    "metaio_class_issued_total",
                    vec![
                        ("class", class.as_str().to_string()),
                        ("direction", direction.as_str().to_string()),
                    ],
                    self.issued_for_class(class, direction) as f64,
                );
            }
        }
        for direction in IoDirection::ALL {
            let labels = vec![("direction", direction.as_str().to_string())];
            set.push("metaio_completed_total", labels.clone(), self.completed(direction) as f64);
            set.push("metaio_failed_total", labels.clone(), self.failed(direction) as f64);
            set.push("metaio_page_io_total", labels, self.page_ios(direction) as f64);
        }

        set.push("metaio_deferrals_total", Vec::new(), self.deferrals() as f64);
        set.push("metaio_build_stalls_total", Vec::new(), self.stalls() as f64);
        set.push("metaio_submit_retries_total", Vec::new(), self.submit_retries() as f64);
        set.push("metaio_merged_requests_total", Vec::new(), self.merged() as f64);
        set.push("metaio_cache_hits_total", Vec::new(), self.cache_hits() as f64);

        for (name, histogram) in [
            ("metaio_unit_hold_us", &self.unit_hold),
            ("metaio_request_latency_us", &self.request_latency),
        ] {
            set.push(name, vec![("quantile", "0.5".to_string())], histogram.quantile_us(0.5) as f64);
            set.push(name, vec![("quantile", "0.99".to_string())], histogram.quantile_us(0.99) as f64);
            set.push(name, vec![("quantile", "mean".to_string())], histogram.mean_us() as f64);
            set.push(name, vec![("quantile", "max".to_string())], histogram.max_us() as f64);
        }

        set.push("metaio_orchestrators_free", Vec::new(), gauges.free_orchestrators as f64);
        set.push("metaio_orchestrators_active", Vec::new(), gauges.active_orchestrators as f64);
        for kind in UnitKind::ALL {
            let labels = vec![("kind", kind.as_str().to_string())];
            set.push("metaio_units_free", labels.clone(), gauges.free_units[kind.index()] as f64);
            set.push("metaio_units_used", labels, gauges.used_units[kind.index()] as f64);
        }
        set.push("metaio_cache_entries", Vec::new(), gauges.cache_entries as f64);
        set.push("metaio_cache_resident", Vec::new(), gauges.cache_resident as f64);
        set.push("metaio_request_queue_depth", Vec::new(), gauges.request_queue_depth as f64);
        set.push(
            "metaio_completion_queue_depth",
            Vec::new(),
            gauges.completion_queue_depth as f64,
        );
        set.push("metaio_pending_requests", Vec::new(), gauges.pending_requests as f64);
        set.push("metaio_stalled_builds", Vec::new(), gauges.stalled_builds as f64);
        set
    }
}

/// Destination for periodic metric sets
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, metrics: &MetricSet);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn publish(&self, _metrics: &MetricSet) {}
}

/// Logs each round through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn publish(&self, metrics: &MetricSet) {
        info!(entries = metrics.len(), "metaio metrics");
        for metric in &metrics.entries {
            debug!(metric = metric.name, labels = ?metric.labels, value = metric.value, "metric");
        }
    }
}

/// Forwards each round to the process-wide `metrics` recorder
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorderSink;

impl TelemetrySink for MetricsRecorderSink {
    fn publish(&self, metrics: &MetricSet) {
        for metric in &metrics.entries {
            metrics::gauge!(metric.name, &metric.labels).set(metric.value);
        }
    }
}

/// Keeps every published round in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    rounds: Mutex<Vec<MetricSet>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn rounds(&self) -> usize {
        self.rounds.lock().len()
    }

    #[must_use]
    pub fn last(&self) -> Option<MetricSet> {
        self.rounds.lock().last().cloned()
    }
}

impl TelemetrySink for RecordingSink {
    fn publish(&self, metrics: &MetricSet) {
        self.rounds.lock().push(metrics.clone());
    }
}

/// Rate-limits publishing to one round per interval
pub struct MetricsPublisher {
    sink: Arc<dyn TelemetrySink>,
    interval: Duration,
    last: Instant,
}

impl MetricsPublisher {
    #[must_use]
    pub fn new(sink: Arc<dyn TelemetrySink>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            last: Instant::now(),
        }
    }

    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        now.duration_since(self.last) >= self.interval
    }

    pub fn publish(&mut self, now: Instant, metrics: &MetricSet) {
        self.last = now;
        self.sink.publish(metrics);
    }
}

impl std::fmt::Debug for MetricsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsPublisher")
            .field("interval", &self.interval)
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}
