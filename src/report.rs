//! Report generation for load-test runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::AggregateSnapshot;
use crate::scheduler::SchedulerStats;

/// Pass/fail totals of one check across the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

impl CheckSummary {
    pub fn total(&self) -> u64 {
        self.passes + self.fails
    }

    /// Pass rate as a percentage (100 when nothing was recorded)
    pub fn pass_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 100.0;
        }
        (self.passes as f64 / total as f64) * 100.0
    }
}

/// Latency statistics in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Transport failures by kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportErrors {
    pub timeout: u64,
    pub connection_failed: u64,
    pub decode_error: u64,
}

impl TransportErrors {
    pub fn total(&self) -> u64 {
        self.timeout + self.connection_failed + self.decode_error
    }
}

/// Complete run report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub name: String,
    pub policy: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub iterations: u64,
    pub iterations_per_second: f64,
    pub dropped_iterations: u64,
    pub interrupted_iterations: u64,
    pub peak_in_flight: usize,
    pub transport_errors: TransportErrors,
    pub checks: Vec<CheckSummary>,
    pub latency: LatencySummary,
}

/// Pass/fail criteria for a whole run. Unset limits never fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Highest tolerated share of failed checks, 0.0..=1.0 (0.0 = any failure fails the run)
    pub max_check_failure_rate: Option<f64>,
    pub max_latency_p95_ms: Option<f64>,
}

/// A threshold the run did not meet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breach {
    pub threshold: String,
    pub limit: f64,
    pub actual: f64,
}

impl std::fmt::Display for Breach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {:.4} exceeds limit {:.4}",
            self.threshold, self.actual, self.limit
        )
    }
}

impl RunSummary {
    /// Build the summary from the aggregator and scheduler outputs
    pub fn from_parts(
        name: impl Into<String>,
        policy: impl Into<String>,
        started_at: DateTime<Utc>,
        aggregate: AggregateSnapshot,
        scheduler: SchedulerStats,
    ) -> Self {
        let elapsed_secs = aggregate.elapsed.as_secs_f64();
        let iterations_per_second = if elapsed_secs > 0.0 {
            aggregate.iterations as f64 / elapsed_secs
        } else {
            0.0
        };

        let checks = aggregate
            .checks
            .into_iter()
            .map(|(name, passes, fails)| CheckSummary {
                name,
                passes,
                fails,
            })
            .collect();

        let latency = LatencySummary {
            samples: aggregate.latency.samples,
            min_ms: aggregate.latency.min,
            mean_ms: aggregate.latency.mean,
            p50_ms: aggregate.latency.p50,
            p90_ms: aggregate.latency.p90,
            p95_ms: aggregate.latency.p95,
            p99_ms: aggregate.latency.p99,
            max_ms: aggregate.latency.max,
        };

        Self {
            name: name.into(),
            policy: policy.into(),
            started_at,
            elapsed_secs,
            iterations: aggregate.iterations,
            iterations_per_second,
            dropped_iterations: aggregate.dropped_iterations,
            interrupted_iterations: aggregate.interrupted_iterations,
            peak_in_flight: scheduler.peak_in_flight,
            transport_errors: TransportErrors {
                timeout: aggregate.timeouts,
                connection_failed: aggregate.connection_failures,
                decode_error: aggregate.decode_errors,
            },
            checks,
            latency,
        }
    }

    pub fn check(&self, name: &str) -> Option<&CheckSummary> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Failed checks over all recorded checks, 0.0..=1.0
    pub fn check_failure_rate(&self) -> f64 {
        let (fails, total) = self
            .checks
            .iter()
            .fold((0u64, 0u64), |(f, t), c| (f + c.fails, t + c.total()));
        if total == 0 {
            return 0.0;
        }
        fails as f64 / total as f64
    }

    /// Thresholds this run did not meet
    pub fn evaluate(&self, thresholds: &Thresholds) -> Vec<Breach> {
        let mut breaches = Vec::new();

        if let Some(limit) = thresholds.max_check_failure_rate {
            let actual = self.check_failure_rate();
            if actual > limit {
                breaches.push(Breach {
                    threshold: "check failure rate".to_string(),
                    limit,
                    actual,
                });
            }
        }

        if let Some(limit) = thresholds.max_latency_p95_ms {
            if self.latency.p95_ms > limit {
                breaches.push(Breach {
                    threshold: "latency p95 (ms)".to_string(),
                    limit,
                    actual: self.latency.p95_ms,
                });
            }
        }

        breaches
    }

    /// Print the report as an ASCII table
    pub fn print_table(&self) {
        println!();
        println!("╔════════════════════════════════════════════════════════════════════════╗");
        println!("║ {:<70} ║", format!("LOAD TEST: {}", self.name));
        println!("╚════════════════════════════════════════════════════════════════════════╝");
        println!();
        println!("  Policy:       {}", self.policy);
        println!("  Started:      {}", self.started_at.to_rfc3339());
        println!("  Elapsed:      {:.2}s", self.elapsed_secs);
        println!(
            "  Iterations:   {} ({:.1}/s), peak in flight {}",
            self.iterations, self.iterations_per_second, self.peak_in_flight
        );
        println!(
            "  Dropped:      {}   Interrupted: {}",
            self.dropped_iterations, self.interrupted_iterations
        );
        println!(
            "  Transport:    timeout {}, connection failed {}, decode error {}",
            self.transport_errors.timeout,
            self.transport_errors.connection_failed,
            self.transport_errors.decode_error
        );
        println!();
        println!("┌──────────────────────────────┬──────────┬──────────┬──────────┐");
        println!("│ Check                        │   Passes │    Fails │  Pass %  │");
        println!("├──────────────────────────────┼──────────┼──────────┼──────────┤");

        for check in &self.checks {
            let mark = if check.fails == 0 { "✓" } else { "✗" };
            println!(
                "│ {} {:<26} │ {:>8} │ {:>8} │ {:>7.1}% │",
                mark,
                check.name,
                check.passes,
                check.fails,
                check.pass_rate()
            );
        }

        println!("└──────────────────────────────┴──────────┴──────────┴──────────┘");
        println!();
        println!(
            "  Latency (ms): min {:.1}, mean {:.1}, p50 {:.1}, p90 {:.1}, p95 {:.1}, p99 {:.1}, max {:.1}",
            self.latency.min_ms,
            self.latency.mean_ms,
            self.latency.p50_ms,
            self.latency.p90_ms,
            self.latency.p95_ms,
            self.latency.p99_ms,
            self.latency.max_ms
        );
        println!();
    }

    /// Export the report as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
