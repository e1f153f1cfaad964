//! Lock-free metrics collection and periodic reporting
//!
//! Camera workers, bus consumers and request handlers all record into one
//! shared `Metrics`. Counter updates are atomics only. `report()` swaps the
//! per-interval values for the periodic log; `snapshot()` reads cumulative
//! values without resetting anything, for scrapers.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only; do not use them for coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries for detection latency (milliseconds)
/// Buckets: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120
const BUCKET_BOUNDS: [u64; 10] = [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Read all buckets without resetting them
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120, 10240];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Frames pulled from camera sources (monotonic)
    frames_read_total: AtomicU64,
    /// Frames that passed the sampler and went to the detector (monotonic)
    frames_processed_total: AtomicU64,
    /// Frames processed since last report (reset on report)
    frames_since_report: AtomicU64,
    /// Detector invocations that failed (monotonic)
    detection_failures_total: AtomicU64,
    /// Stream read/open failures that triggered a reconnect (monotonic)
    source_failures_total: AtomicU64,
    /// Detection latency histogram buckets (reset on report)
    detection_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of detection latencies in ms (reset on report)
    detection_latency_sum_ms: AtomicU64,
    /// Max detection latency in ms (reset on report)
    detection_latency_max_ms: AtomicU64,
    /// Detection latency histogram since start (monotonic)
    detection_latency_buckets_total: [AtomicU64; NUM_BUCKETS],
    /// Sum of all detection latencies in ms (monotonic)
    detection_latency_sum_ms_total: AtomicU64,
    /// Spot status transitions written to the store (monotonic)
    status_changes_total: AtomicU64,
    /// Events handed to the bus (monotonic)
    events_published_total: AtomicU64,
    /// Subscribers dropped for being full or closed (monotonic)
    subscribers_dropped_total: AtomicU64,
    /// Currently registered bus subscribers
    subscribers_active: AtomicU64,
    /// Camera workers started
    cameras_active: AtomicU64,
    /// Route requests served (monotonic)
    route_requests_total: AtomicU64,
    /// Route requests with no path (monotonic)
    route_no_path_total: AtomicU64,
    /// Assignment requests that returned a spot (monotonic)
    assignments_total: AtomicU64,
    /// Assignment requests with no free spot (monotonic)
    assignments_exhausted_total: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_read_total: AtomicU64::new(0),
            frames_processed_total: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            detection_failures_total: AtomicU64::new(0),
            source_failures_total: AtomicU64::new(0),
            detection_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            detection_latency_sum_ms: AtomicU64::new(0),
            detection_latency_max_ms: AtomicU64::new(0),
            detection_latency_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            detection_latency_sum_ms_total: AtomicU64::new(0),
            status_changes_total: AtomicU64::new(0),
            events_published_total: AtomicU64::new(0),
            subscribers_dropped_total: AtomicU64::new(0),
            subscribers_active: AtomicU64::new(0),
            cameras_active: AtomicU64::new(0),
            route_requests_total: AtomicU64::new(0),
            route_no_path_total: AtomicU64::new(0),
            assignments_total: AtomicU64::new(0),
            assignments_exhausted_total: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_frame_read(&self) {
        self.frames_read_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a processed frame with its detection latency (lock-free)
    #[inline]
    pub fn record_frame_processed(&self, detection_ms: u64) {
        self.frames_processed_total.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
        self.detection_latency_sum_ms.fetch_add(detection_ms, Ordering::Relaxed);
        self.detection_latency_sum_ms_total.fetch_add(detection_ms, Ordering::Relaxed);
        let bucket = bucket_index(detection_ms);
        self.detection_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.detection_latency_buckets_total[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.detection_latency_max_ms, detection_ms);
    }

    #[inline]
    pub fn record_detection_failure(&self) {
        self.detection_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_source_failure(&self) {
        self.source_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_status_change(&self) {
        self.status_changes_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_published(&self) {
        self.events_published_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_subscriber_dropped(&self) {
        self.subscribers_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_subscribers_active(&self, count: usize) {
        self.subscribers_active.store(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_camera_started(&self) {
        self.cameras_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_route(&self, found: bool) {
        self.route_requests_total.fetch_add(1, Ordering::Relaxed);
        if !found {
            self.route_no_path_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_assignment(&self, assigned: bool) {
        if assigned {
            self.assignments_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.assignments_exhausted_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn status_changes_total(&self) -> u64 {
        self.status_changes_total.load(Ordering::Relaxed)
    }

    pub fn detection_failures_total(&self) -> u64 {
        self.detection_failures_total.load(Ordering::Relaxed)
    }

    pub fn source_failures_total(&self) -> u64 {
        self.source_failures_total.load(Ordering::Relaxed)
    }

    pub fn subscribers_dropped_total(&self) -> u64 {
        self.subscribers_dropped_total.load(Ordering::Relaxed)
    }

    /// Generate a snapshot, resetting per-interval values
    pub fn report(&self) -> MetricsSummary {
        let now = Instant::now();
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = now.duration_since(*last).as_secs_f64();
            *last = now;
            elapsed
        };

        let frames_interval = self.frames_since_report.swap(0, Ordering::Relaxed);
        let frames_per_sec =
            if elapsed_secs > 0.0 { frames_interval as f64 / elapsed_secs } else { 0.0 };

        let detection_lat_buckets = swap_buckets(&self.detection_latency_buckets);
        let detection_sum = self.detection_latency_sum_ms.swap(0, Ordering::Relaxed);
        let detection_lat_max_ms = self.detection_latency_max_ms.swap(0, Ordering::Relaxed);

        self.summary(frames_per_sec, detection_lat_buckets, detection_sum, detection_lat_max_ms)
    }

    /// Cumulative view since start; resets nothing, so scrapes do not disturb
    /// the periodic report. `frames_per_sec` is left at 0 (use a rate over
    /// `frames_processed_total` instead); the max is the current interval's.
    pub fn snapshot(&self) -> MetricsSummary {
        self.summary(
            0.0,
            load_buckets(&self.detection_latency_buckets_total),
            self.detection_latency_sum_ms_total.load(Ordering::Relaxed),
            self.detection_latency_max_ms.load(Ordering::Relaxed),
        )
    }

    fn summary(
        &self,
        frames_per_sec: f64,
        detection_lat_buckets: [u64; NUM_BUCKETS],
        detection_lat_sum_ms: u64,
        detection_lat_max_ms: u64,
    ) -> MetricsSummary {
        let detection_count: u64 = detection_lat_buckets.iter().sum();
        let detection_lat_avg_ms =
            if detection_count > 0 { detection_lat_sum_ms / detection_count } else { 0 };

        MetricsSummary {
            frames_read_total: self.frames_read_total.load(Ordering::Relaxed),
            frames_processed_total: self.frames_processed_total.load(Ordering::Relaxed),
            frames_per_sec,
            detection_failures_total: self.detection_failures_total.load(Ordering::Relaxed),
            source_failures_total: self.source_failures_total.load(Ordering::Relaxed),
            detection_lat_buckets,
            detection_lat_sum_ms,
            detection_lat_avg_ms,
            detection_lat_max_ms,
            detection_lat_p50_ms: percentile_from_buckets(&detection_lat_buckets, 0.50),
            detection_lat_p99_ms: percentile_from_buckets(&detection_lat_buckets, 0.99),
            status_changes_total: self.status_changes_total.load(Ordering::Relaxed),
            events_published_total: self.events_published_total.load(Ordering::Relaxed),
            subscribers_dropped_total: self.subscribers_dropped_total.load(Ordering::Relaxed),
            subscribers_active: self.subscribers_active.load(Ordering::Relaxed),
            cameras_active: self.cameras_active.load(Ordering::Relaxed),
            route_requests_total: self.route_requests_total.load(Ordering::Relaxed),
            route_no_path_total: self.route_no_path_total.load(Ordering::Relaxed),
            assignments_total: self.assignments_total.load(Ordering::Relaxed),
            assignments_exhausted_total: self.assignments_exhausted_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for the Prometheus formatter)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub frames_read_total: u64,
    pub frames_processed_total: u64,
    pub frames_per_sec: f64,
    pub detection_failures_total: u64,
    pub source_failures_total: u64,
    /// Detection latency histogram buckets (ms)
    pub detection_lat_buckets: [u64; NUM_BUCKETS],
    pub detection_lat_sum_ms: u64,
    pub detection_lat_avg_ms: u64,
    pub detection_lat_max_ms: u64,
    pub detection_lat_p50_ms: u64,
    pub detection_lat_p99_ms: u64,
    pub status_changes_total: u64,
    pub events_published_total: u64,
    pub subscribers_dropped_total: u64,
    pub subscribers_active: u64,
    pub cameras_active: u64,
    pub route_requests_total: u64,
    pub route_no_path_total: u64,
    pub assignments_total: u64,
    pub assignments_exhausted_total: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            cameras = %self.cameras_active,
            frames_read = %self.frames_read_total,
            frames_processed = %self.frames_processed_total,
            frames_per_sec = format!("{:.2}", self.frames_per_sec),
            detect_avg_ms = %self.detection_lat_avg_ms,
            detect_p99_ms = %self.detection_lat_p99_ms,
            detect_failures = %self.detection_failures_total,
            source_failures = %self.source_failures_total,
            status_changes = %self.status_changes_total,
            subscribers = %self.subscribers_active,
            subscribers_dropped = %self.subscribers_dropped_total,
            "metrics"
        );
    }
}
