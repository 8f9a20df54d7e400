//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering; these are statistical counters
//! only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::types::EstimateMethod;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
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

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// How an acquisition ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionOutcome {
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Feed records processed by the monitor (monotonic)
    feed_records_total: AtomicU64,
    /// Feed records since last report (reset on report)
    feed_records_since_report: AtomicU64,
    /// Readings discarded as sentinel or no-detection
    readings_dropped_total: AtomicU64,
    /// Feed records dropped because the monitor queue was full
    feed_records_dropped: AtomicU64,
    /// Uplinks rejected by the decoder
    uplinks_invalid_total: AtomicU64,
    /// Uplinks ignored as redeliveries
    uplinks_duplicate_total: AtomicU64,

    estimates_fingerprint_total: AtomicU64,
    estimates_trilateration_total: AtomicU64,
    /// Cycles with neither an estimate nor a signal override
    cycles_skipped_total: AtomicU64,
    /// Estimation latency sum since last report (reset on report)
    estimate_latency_sum_us: AtomicU64,
    estimate_latency_max_us: AtomicU64,
    estimate_latency_buckets: [AtomicU64; NUM_BUCKETS],
    estimates_since_report: AtomicU64,

    exits_total: AtomicU64,
    reentries_total: AtomicU64,

    alerts_raised_total: AtomicU64,
    alerts_dismissed_total: AtomicU64,
    alerts_expired_total: AtomicU64,

    acquisitions_completed: AtomicU64,
    acquisitions_timed_out: AtomicU64,
    acquisitions_cancelled: AtomicU64,
    acquisitions_failed: AtomicU64,

    /// Current monitor queue depth (point-in-time)
    feed_queue_depth: AtomicU64,
    /// Currently active alerts (point-in-time)
    active_alerts: AtomicU64,
    /// Devices currently judged outside (point-in-time)
    exited_devices: AtomicU64,

    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            feed_records_total: AtomicU64::new(0),
            feed_records_since_report: AtomicU64::new(0),
            readings_dropped_total: AtomicU64::new(0),
            feed_records_dropped: AtomicU64::new(0),
            uplinks_invalid_total: AtomicU64::new(0),
            uplinks_duplicate_total: AtomicU64::new(0),
            estimates_fingerprint_total: AtomicU64::new(0),
            estimates_trilateration_total: AtomicU64::new(0),
            cycles_skipped_total: AtomicU64::new(0),
            estimate_latency_sum_us: AtomicU64::new(0),
            estimate_latency_max_us: AtomicU64::new(0),
            estimate_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            estimates_since_report: AtomicU64::new(0),
            exits_total: AtomicU64::new(0),
            reentries_total: AtomicU64::new(0),
            alerts_raised_total: AtomicU64::new(0),
            alerts_dismissed_total: AtomicU64::new(0),
            alerts_expired_total: AtomicU64::new(0),
            acquisitions_completed: AtomicU64::new(0),
            acquisitions_timed_out: AtomicU64::new(0),
            acquisitions_cancelled: AtomicU64::new(0),
            acquisitions_failed: AtomicU64::new(0),
            feed_queue_depth: AtomicU64::new(0),
            active_alerts: AtomicU64::new(0),
            exited_devices: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a feed record reaching the monitor
    #[inline]
    pub fn record_feed_record(&self, dropped_readings: u64) {
        self.feed_records_total.fetch_add(1, Ordering::Relaxed);
        self.feed_records_since_report.fetch_add(1, Ordering::Relaxed);
        if dropped_readings > 0 {
            self.readings_dropped_total.fetch_add(dropped_readings, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_feed_record_dropped(&self) {
        self.feed_records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_uplink_invalid(&self) {
        self.uplinks_invalid_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_uplink_duplicate(&self) {
        self.uplinks_duplicate_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a produced estimate with its computation latency
    #[inline]
    pub fn record_estimate(&self, method: EstimateMethod, latency_us: u64) {
        match method {
            EstimateMethod::Fingerprint => {
                self.estimates_fingerprint_total.fetch_add(1, Ordering::Relaxed)
            }
            EstimateMethod::Trilateration => {
                self.estimates_trilateration_total.fetch_add(1, Ordering::Relaxed)
            }
        };
        self.estimates_since_report.fetch_add(1, Ordering::Relaxed);
        self.estimate_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.estimate_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.estimate_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_cycle_skipped(&self) {
        self.cycles_skipped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_exit(&self) {
        self.exits_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reentry(&self) {
        self.reentries_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_raised(&self) {
        self.alerts_raised_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_dismissed(&self) {
        self.alerts_dismissed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_expired(&self) {
        self.alerts_expired_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_acquisition(&self, outcome: AcquisitionOutcome) {
        let counter = match outcome {
            AcquisitionOutcome::Completed => &self.acquisitions_completed,
            AcquisitionOutcome::TimedOut => &self.acquisitions_timed_out,
            AcquisitionOutcome::Cancelled => &self.acquisitions_cancelled,
            AcquisitionOutcome::Failed => &self.acquisitions_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_feed_queue_depth(&self, depth: u64) {
        self.feed_queue_depth.store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_active_alerts(&self, count: u64) {
        self.active_alerts.store(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_exited_devices(&self, count: u64) {
        self.exited_devices.store(count, Ordering::Relaxed);
    }

    pub fn feed_records_total(&self) -> u64 {
        self.feed_records_total.load(Ordering::Relaxed)
    }

    pub fn readings_dropped_total(&self) -> u64 {
        self.readings_dropped_total.load(Ordering::Relaxed)
    }

    pub fn feed_records_dropped(&self) -> u64 {
        self.feed_records_dropped.load(Ordering::Relaxed)
    }

    pub fn uplinks_invalid_total(&self) -> u64 {
        self.uplinks_invalid_total.load(Ordering::Relaxed)
    }

    pub fn uplinks_duplicate_total(&self) -> u64 {
        self.uplinks_duplicate_total.load(Ordering::Relaxed)
    }

    pub fn estimates_total(&self, method: EstimateMethod) -> u64 {
        match method {
            EstimateMethod::Fingerprint => self.estimates_fingerprint_total.load(Ordering::Relaxed),
            EstimateMethod::Trilateration => {
                self.estimates_trilateration_total.load(Ordering::Relaxed)
            }
        }
    }

    pub fn cycles_skipped_total(&self) -> u64 {
        self.cycles_skipped_total.load(Ordering::Relaxed)
    }

    pub fn exits_total(&self) -> u64 {
        self.exits_total.load(Ordering::Relaxed)
    }

    pub fn reentries_total(&self) -> u64 {
        self.reentries_total.load(Ordering::Relaxed)
    }

    pub fn alerts_raised_total(&self) -> u64 {
        self.alerts_raised_total.load(Ordering::Relaxed)
    }

    pub fn alerts_dismissed_total(&self) -> u64 {
        self.alerts_dismissed_total.load(Ordering::Relaxed)
    }

    pub fn alerts_expired_total(&self) -> u64 {
        self.alerts_expired_total.load(Ordering::Relaxed)
    }

    pub fn acquisitions_total(&self, outcome: AcquisitionOutcome) -> u64 {
        match outcome {
            AcquisitionOutcome::Completed => self.acquisitions_completed.load(Ordering::Relaxed),
            AcquisitionOutcome::TimedOut => self.acquisitions_timed_out.load(Ordering::Relaxed),
            AcquisitionOutcome::Cancelled => self.acquisitions_cancelled.load(Ordering::Relaxed),
            AcquisitionOutcome::Failed => self.acquisitions_failed.load(Ordering::Relaxed),
        }
    }

    pub fn feed_queue_depth(&self) -> u64 {
        self.feed_queue_depth.load(Ordering::Relaxed)
    }

    pub fn active_alerts(&self) -> u64 {
        self.active_alerts.load(Ordering::Relaxed)
    }

    pub fn exited_devices(&self) -> u64 {
        self.exited_devices.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let records_count = self.feed_records_since_report.swap(0, Ordering::Relaxed);
        let estimates_count = self.estimates_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.estimate_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.estimate_latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.estimate_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let records_per_sec = if elapsed.as_secs_f64() > 0.0 {
            records_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if estimates_count > 0 { latency_sum / estimates_count } else { 0 };

        MetricsSummary {
            feed_records_total: self.feed_records_total(),
            records_per_sec,
            readings_dropped_total: self.readings_dropped_total(),
            feed_records_dropped: self.feed_records_dropped(),
            uplinks_invalid_total: self.uplinks_invalid_total(),
            uplinks_duplicate_total: self.uplinks_duplicate_total(),
            estimates_fingerprint_total: self.estimates_total(EstimateMethod::Fingerprint),
            estimates_trilateration_total: self.estimates_total(EstimateMethod::Trilateration),
            cycles_skipped_total: self.cycles_skipped_total(),
            avg_estimate_latency_us: avg_latency,
            max_estimate_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            exits_total: self.exits_total(),
            reentries_total: self.reentries_total(),
            alerts_raised_total: self.alerts_raised_total(),
            alerts_dismissed_total: self.alerts_dismissed_total(),
            alerts_expired_total: self.alerts_expired_total(),
            acquisitions_completed: self.acquisitions_total(AcquisitionOutcome::Completed),
            acquisitions_timed_out: self.acquisitions_total(AcquisitionOutcome::TimedOut),
            acquisitions_cancelled: self.acquisitions_total(AcquisitionOutcome::Cancelled),
            acquisitions_failed: self.acquisitions_total(AcquisitionOutcome::Failed),
            feed_queue_depth: self.feed_queue_depth(),
            active_alerts: self.active_alerts(),
            exited_devices: self.exited_devices(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for egress)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub feed_records_total: u64,
    pub records_per_sec: f64,
    pub readings_dropped_total: u64,
    pub feed_records_dropped: u64,
    pub uplinks_invalid_total: u64,
    pub uplinks_duplicate_total: u64,
    pub estimates_fingerprint_total: u64,
    pub estimates_trilateration_total: u64,
    pub cycles_skipped_total: u64,
    pub avg_estimate_latency_us: u64,
    pub max_estimate_latency_us: u64,
    /// Estimation latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
    pub exits_total: u64,
    pub reentries_total: u64,
    pub alerts_raised_total: u64,
    pub alerts_dismissed_total: u64,
    pub alerts_expired_total: u64,
    pub acquisitions_completed: u64,
    pub acquisitions_timed_out: u64,
    pub acquisitions_cancelled: u64,
    pub acquisitions_failed: u64,
    /// Current monitor queue depth (snapshot)
    pub feed_queue_depth: u64,
    pub active_alerts: u64,
    pub exited_devices: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            feed_records_total = %self.feed_records_total,
            records_per_sec = format!("{:.2}", self.records_per_sec),
            fingerprint = %self.estimates_fingerprint_total,
            trilateration = %self.estimates_trilateration_total,
            skipped = %self.cycles_skipped_total,
            p99_us = %self.lat_p99_us,
            exits = %self.exits_total,
            reentries = %self.reentries_total,
            active_alerts = %self.active_alerts,
            exited_devices = %self.exited_devices,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.feed_records_total(), 0);
        assert_eq!(metrics.exits_total(), 0);
    }

    #[test]
    fn test_record_feed_record() {
        let metrics = Metrics::new();

        metrics.record_feed_record(0);
        metrics.record_feed_record(2);

        assert_eq!(metrics.feed_records_total(), 2);
        assert_eq!(metrics.readings_dropped_total(), 2);
    }

    #[test]
    fn test_estimates_by_method() {
        let metrics = Metrics::new();

        metrics.record_estimate(EstimateMethod::Fingerprint, 100);
        metrics.record_estimate(EstimateMethod::Fingerprint, 300);
        metrics.record_estimate(EstimateMethod::Trilateration, 200);

        assert_eq!(metrics.estimates_total(EstimateMethod::Fingerprint), 2);
        assert_eq!(metrics.estimates_total(EstimateMethod::Trilateration), 1);
    }

    #[test]
    fn test_acquisition_outcomes() {
        let metrics = Metrics::new();

        metrics.record_acquisition(AcquisitionOutcome::Completed);
        metrics.record_acquisition(AcquisitionOutcome::TimedOut);
        metrics.record_acquisition(AcquisitionOutcome::TimedOut);

        assert_eq!(metrics.acquisitions_total(AcquisitionOutcome::Completed), 1);
        assert_eq!(metrics.acquisitions_total(AcquisitionOutcome::TimedOut), 2);
        assert_eq!(metrics.acquisitions_total(AcquisitionOutcome::Cancelled), 0);
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();

        metrics.record_estimate(EstimateMethod::Fingerprint, 100);
        metrics.record_estimate(EstimateMethod::Fingerprint, 200);
        metrics.record_estimate(EstimateMethod::Trilateration, 300);
        metrics.record_exit();
        metrics.record_alert_raised();
        metrics.set_active_alerts(1);

        let summary = metrics.report();

        assert_eq!(summary.avg_estimate_latency_us, 200);
        assert_eq!(summary.max_estimate_latency_us, 300);
        assert_eq!(summary.exits_total, 1);
        assert_eq!(summary.alerts_raised_total, 1);
        assert_eq!(summary.active_alerts, 1);

        // Periodic counters should be reset, monotonic ones kept
        assert_eq!(metrics.estimate_latency_sum_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.estimate_latency_max_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.estimates_total(EstimateMethod::Fingerprint), 2);
    }

    #[test]
    fn test_report_empty() {
        let metrics = Metrics::new();
        let summary = metrics.report();

        assert_eq!(summary.feed_records_total, 0);
        assert_eq!(summary.avg_estimate_latency_us, 0);
        assert_eq!(summary.lat_p99_us, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    m.record_feed_record(0);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.feed_records_total(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10); // overflow
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();

        for _ in 0..100 {
            metrics.record_estimate(EstimateMethod::Fingerprint, 150);
        }

        let summary = metrics.report();

        assert_eq!(summary.lat_buckets[1], 100);
        assert_eq!(summary.lat_p50_us, 200);
        assert_eq!(summary.lat_p99_us, 200);
    }
}
