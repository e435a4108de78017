//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//!
//! NOTE: All atomics use Relaxed ordering: these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

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

/// Lock-free metrics collector
pub struct Metrics {
    /// Detection messages accepted by ingress (monotonic)
    events_received: AtomicU64,
    /// Detection events dropped because the tracker channel was full (monotonic)
    events_dropped: AtomicU64,
    /// Absence messages skipped by the ingress throttle (monotonic)
    events_throttled: AtomicU64,
    /// Malformed payloads or topics (monotonic)
    parse_errors: AtomicU64,
    /// Events for zones without tracker state (monotonic)
    unknown_zone_events: AtomicU64,
    /// Events processed by the tracker (monotonic)
    events_processed: AtomicU64,
    /// Events processed since last report (reset on report)
    events_since_report: AtomicU64,
    /// Sum of processing latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max processing latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Alerts raised by the tracker (monotonic)
    alerts_raised: AtomicU64,
    /// Alerts dropped because the dispatch queue was full (monotonic)
    alerts_dropped: AtomicU64,
    /// Zones currently in the alerting state
    zones_alerting: AtomicU64,
    /// Snapshot requests or downloads that failed (monotonic)
    snapshot_failures: AtomicU64,
    /// Messages delivered to a destination (monotonic)
    deliveries_sent: AtomicU64,
    /// Per-destination delivery failures (monotonic)
    deliveries_failed: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            events_throttled: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            unknown_zone_events: AtomicU64::new(0),
            events_processed: AtomicU64::new(0),
            events_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            alerts_raised: AtomicU64::new(0),
            alerts_dropped: AtomicU64::new(0),
            zones_alerting: AtomicU64::new(0),
            snapshot_failures: AtomicU64::new(0),
            deliveries_sent: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_throttled(&self) {
        self.events_throttled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unknown_zone(&self) {
        self.unknown_zone_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event was processed by the tracker with given latency
    #[inline]
    pub fn record_event_processed(&self, latency_us: u64) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.events_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_alert_raised(&self) {
        self.alerts_raised.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_dropped(&self) {
        self.alerts_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the number of zones currently alerting (written by the tracker only)
    #[inline]
    pub fn set_zones_alerting(&self, count: u64) {
        self.zones_alerting.store(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_snapshot_failure(&self) {
        self.snapshot_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery_sent(&self) {
        self.deliveries_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery_failed(&self) {
        self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn alerts_raised(&self) -> u64 {
        self.alerts_raised.load(Ordering::Relaxed)
    }

    /// Monotonic counters and gauges without touching the report window
    pub fn snapshot(&self) -> MetricsSummary {
        self.build_summary(0.0, 0, 0)
    }

    /// Generate a report, resetting the per-window latency statistics
    pub fn report(&self) -> MetricsSummary {
        let events = self.events_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let events_per_sec =
            if elapsed.as_secs_f64() > 0.0 { events as f64 / elapsed.as_secs_f64() } else { 0.0 };
        let avg_latency = if events > 0 { latency_sum / events } else { 0 };

        self.build_summary(events_per_sec, avg_latency, max_latency)
    }

    fn build_summary(
        &self,
        events_per_sec: f64,
        avg_process_latency_us: u64,
        max_process_latency_us: u64,
    ) -> MetricsSummary {
        MetricsSummary {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_throttled: self.events_throttled.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            unknown_zone_events: self.unknown_zone_events.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_per_sec,
            avg_process_latency_us,
            max_process_latency_us,
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            alerts_dropped: self.alerts_dropped.load(Ordering::Relaxed),
            zones_alerting: self.zones_alerting.load(Ordering::Relaxed),
            snapshot_failures: self.snapshot_failures.load(Ordering::Relaxed),
            deliveries_sent: self.deliveries_sent.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub events_received: u64,
    pub events_dropped: u64,
    pub events_throttled: u64,
    pub parse_errors: u64,
    pub unknown_zone_events: u64,
    pub events_processed: u64,
    pub events_per_sec: f64,
    pub avg_process_latency_us: u64,
    pub max_process_latency_us: u64,
    pub alerts_raised: u64,
    pub alerts_dropped: u64,
    pub zones_alerting: u64,
    pub snapshot_failures: u64,
    pub deliveries_sent: u64,
    pub deliveries_failed: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            events_received = %self.events_received,
            events_processed = %self.events_processed,
            events_per_sec = format!("{:.1}", self.events_per_sec),
            avg_latency_us = %self.avg_process_latency_us,
            max_latency_us = %self.max_process_latency_us,
            events_dropped = %self.events_dropped,
            parse_errors = %self.parse_errors,
            alerts_raised = %self.alerts_raised,
            zones_alerting = %self.zones_alerting,
            deliveries_sent = %self.deliveries_sent,
            deliveries_failed = %self.deliveries_failed,
            "metrics"
        );
    }
}
