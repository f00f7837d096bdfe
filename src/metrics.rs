//! Run-wide aggregation of check outcomes and latency using HdrHistogram.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hdrhistogram::Histogram;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::TransportErrorKind;
use crate::report::RunSummary;
use crate::scheduler::{ConcurrencyPolicy, SchedulerStats};

/// Pass/fail counters for one check
#[derive(Debug, Default)]
struct CheckCounter {
    passes: AtomicU64,
    fails: AtomicU64,
}

/// Thread-safe accumulator shared by all workers.
///
/// Every operation is a commutative increment, so the final totals do not
/// depend on the order in which workers report.
pub struct Aggregator {
    /// Check name -> counters
    checks: DashMap<String, CheckCounter>,
    /// Registration order of known checks, for stable output
    check_order: Vec<String>,
    /// Response latency (microseconds)
    latency_histogram: Mutex<Histogram<u64>>,
    /// Iterations that ran to completion (with or without a transport error)
    iterations: AtomicU64,
    timeouts: AtomicU64,
    connection_failures: AtomicU64,
    decode_errors: AtomicU64,
    /// Arrivals that found no free worker
    dropped_iterations: AtomicU64,
    /// In-flight iterations cut off by a hard stop
    interrupted_iterations: AtomicU64,
    start_time: Mutex<Option<Instant>>,
    end_time: Mutex<Option<Instant>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::with_checks(std::iter::empty::<&str>())
    }

    /// Pre-register check names so they appear (in this order) even if never recorded
    pub fn with_checks<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let check_order: Vec<String> = names.into_iter().map(Into::into).collect();
        let checks = DashMap::new();
        for name in &check_order {
            checks.insert(name.clone(), CheckCounter::default());
        }

        Self {
            checks,
            check_order,
            // Latencies up to 10 minutes with 3 significant figures
            latency_histogram: Mutex::new(
                Histogram::new_with_bounds(1, 600_000_000, 3)
                    .expect("constant histogram bounds are valid"),
            ),
            iterations: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            dropped_iterations: AtomicU64::new(0),
            interrupted_iterations: AtomicU64::new(0),
            start_time: Mutex::new(None),
            end_time: Mutex::new(None),
        }
    }

    /// Mark the start of the run
    pub fn start(&self) {
        if let Ok(mut start) = self.start_time.lock() {
            *start = Some(Instant::now());
        }
    }

    /// Mark the end of the run
    pub fn stop(&self) {
        if let Ok(mut end) = self.end_time.lock() {
            *end = Some(Instant::now());
        }
    }

    /// Record one check outcome
    pub fn record(&self, check: &str, passed: bool) {
        // Fast path avoids allocating the key for known checks
        if let Some(counter) = self.checks.get(check) {
            counter.bump(passed);
            return;
        }
        self.checks
            .entry(check.to_string())
            .or_default()
            .bump(passed);
    }

    /// Record the latency of an iteration, failed ones timed up to the failure
    pub fn record_latency(&self, latency: Duration) {
        let latency_us = latency.as_micros().min(u64::MAX as u128) as u64;
        if let Ok(mut hist) = self.latency_histogram.lock() {
            hist.saturating_record(latency_us.max(1));
        }
    }

    /// Count a finished iteration
    pub fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_error(&self, kind: TransportErrorKind) {
        let counter = match kind {
            TransportErrorKind::Timeout => &self.timeouts,
            TransportErrorKind::ConnectionFailed => &self.connection_failures,
            TransportErrorKind::DecodeError => &self.decode_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.dropped_iterations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_interrupted(&self, count: u64) {
        self.interrupted_iterations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub fn dropped_iterations(&self) -> u64 {
        self.dropped_iterations.load(Ordering::Relaxed)
    }

    pub fn interrupted_iterations(&self) -> u64 {
        self.interrupted_iterations.load(Ordering::Relaxed)
    }

    /// (passes, fails) for a check
    pub fn check_counts(&self, check: &str) -> Option<(u64, u64)> {
        self.checks.get(check).map(|c| c.load())
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        let start = self.start_time.lock().ok().and_then(|s| *s);
        let end = self.end_time.lock().ok().and_then(|e| *e);
        match (start, end) {
            (Some(s), Some(e)) => e.duration_since(s),
            (Some(s), None) => s.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Consistent copy of the counters.
    ///
    /// Known checks come first in registration order, any others follow
    /// sorted by name.
    pub fn snapshot(&self) -> AggregateSnapshot {
        let mut checks: Vec<(String, u64, u64)> = self
            .check_order
            .iter()
            .filter_map(|name| {
                self.check_counts(name)
                    .map(|(passes, fails)| (name.clone(), passes, fails))
            })
            .collect();

        let mut extra: Vec<(String, u64, u64)> = self
            .checks
            .iter()
            .filter(|entry| !self.check_order.contains(entry.key()))
            .map(|entry| {
                let (passes, fails) = entry.value().load();
                (entry.key().clone(), passes, fails)
            })
            .collect();
        extra.sort_by(|a, b| a.0.cmp(&b.0));
        checks.extend(extra);

        let latency = self
            .latency_histogram
            .lock()
            .map(|hist| LatencySnapshot::from_histogram(&hist))
            .unwrap_or_default();

        AggregateSnapshot {
            checks,
            latency,
            iterations: self.iterations(),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            dropped_iterations: self.dropped_iterations(),
            interrupted_iterations: self.interrupted_iterations(),
            elapsed: self.elapsed(),
        }
    }

    /// Final report for a run driven under `policy`
    pub fn summarize(
        &self,
        name: &str,
        policy: &ConcurrencyPolicy,
        started_at: DateTime<Utc>,
        scheduler: SchedulerStats,
    ) -> RunSummary {
        RunSummary::from_parts(name, policy.to_string(), started_at, self.snapshot(), scheduler)
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckCounter {
    fn bump(&self, passed: bool) {
        let counter = if passed { &self.passes } else { &self.fails };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn load(&self) -> (u64, u64) {
        (
            self.passes.load(Ordering::Relaxed),
            self.fails.load(Ordering::Relaxed),
        )
    }
}

/// Latency statistics in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencySnapshot {
    pub samples: u64,
    pub min: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

impl LatencySnapshot {
    fn from_histogram(hist: &Histogram<u64>) -> Self {
        if hist.is_empty() {
            return Self::default();
        }
        let ms = |us: u64| us as f64 / 1000.0;
        Self {
            samples: hist.len(),
            min: ms(hist.min()),
            mean: hist.mean() / 1000.0,
            p50: ms(hist.value_at_quantile(0.50)),
            p90: ms(hist.value_at_quantile(0.90)),
            p95: ms(hist.value_at_quantile(0.95)),
            p99: ms(hist.value_at_quantile(0.99)),
            max: ms(hist.max()),
        }
    }
}

/// A snapshot of the aggregator at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSnapshot {
    /// (name, passes, fails)
    pub checks: Vec<(String, u64, u64)>,
    pub latency: LatencySnapshot,
    pub iterations: u64,
    pub timeouts: u64,
    pub connection_failures: u64,
    pub decode_errors: u64,
    pub dropped_iterations: u64,
    pub interrupted_iterations: u64,
    pub elapsed: Duration,
}
