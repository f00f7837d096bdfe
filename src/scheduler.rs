//! Scheduling of iterations under a declarative concurrency policy.
//!
//! Two policies are supported:
//!
//! - **FixedPool** (closed loop): `count` workers each run one iteration after
//!   another until the run duration expires. An iteration's latency directly
//!   delays that worker's next iteration.
//! - **ConstantArrivalRate** (open loop): a single issuing loop starts a new
//!   iteration every `time_unit / rate`, whether or not earlier iterations
//!   have finished. Each arrival borrows one of `pre_allocated_workers`
//!   permits; when none is free the arrival is handled by the configured
//!   [`ArrivalOverflow`] policy and counted, never silently lost.
//!
//! In both cases no iteration starts after the deadline (or after shutdown was
//! requested). Iterations already in flight are allowed to finish unless a
//! `hard_stop` grace period is configured, in which case they are aborted once
//! it elapses.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

use crate::error::{LoadError, Result};

/// How iterations are paced
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// `count` concurrent workers loop for `duration`
    FixedPool { count: usize, duration: Duration },
    /// `rate` iterations start per `time_unit` for `duration`
    ConstantArrivalRate {
        rate: f64,
        time_unit: Duration,
        duration: Duration,
        pre_allocated_workers: usize,
    },
}

impl ConcurrencyPolicy {
    /// Reject policies that cannot produce a run
    pub fn validate(&self) -> Result<()> {
        if self.duration().is_zero() {
            return Err(LoadError::InvalidPolicy("duration must be > 0".to_string()));
        }

        match *self {
            ConcurrencyPolicy::FixedPool { count, .. } => {
                if count == 0 {
                    return Err(LoadError::InvalidPolicy(
                        "worker count must be > 0".to_string(),
                    ));
                }
            }
            ConcurrencyPolicy::ConstantArrivalRate {
                rate,
                time_unit,
                pre_allocated_workers,
                ..
            } => {
                if !(rate.is_finite() && rate > 0.0) {
                    return Err(LoadError::InvalidPolicy(format!(
                        "rate must be a positive number, got {}",
                        rate
                    )));
                }
                if time_unit.is_zero() {
                    return Err(LoadError::InvalidPolicy(
                        "time unit must be > 0".to_string(),
                    ));
                }
                if pre_allocated_workers == 0 {
                    return Err(LoadError::InvalidPolicy(
                        "pre-allocated workers must be > 0".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn duration(&self) -> Duration {
        match *self {
            ConcurrencyPolicy::FixedPool { duration, .. } => duration,
            ConcurrencyPolicy::ConstantArrivalRate { duration, .. } => duration,
        }
    }

    /// Upper bound on concurrently running iterations
    pub fn max_workers(&self) -> usize {
        match *self {
            ConcurrencyPolicy::FixedPool { count, .. } => count,
            ConcurrencyPolicy::ConstantArrivalRate {
                pre_allocated_workers,
                ..
            } => pre_allocated_workers,
        }
    }
}

impl std::fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConcurrencyPolicy::FixedPool { count, duration } => write!(
                f,
                "fixed-pool: {} workers for {}",
                count,
                humantime::format_duration(*duration)
            ),
            ConcurrencyPolicy::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                pre_allocated_workers,
            } => write!(
                f,
                "constant-arrival-rate: {} per {} for {} ({} workers)",
                rate,
                humantime::format_duration(*time_unit),
                humantime::format_duration(*duration),
                pre_allocated_workers
            ),
        }
    }
}

/// What happens to an arrival when every worker is busy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArrivalOverflow {
    /// Count it as a dropped iteration
    #[default]
    Drop,
    /// Wait for a worker; at most `capacity` arrivals wait at once, the rest are dropped
    Queue { capacity: usize },
}

/// Knobs that apply to every policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerOptions {
    pub overflow: ArrivalOverflow,
    /// Grace period for in-flight iterations after the run ends; `None` waits indefinitely
    pub hard_stop: Option<Duration>,
}

/// Identity of one iteration, handed to the iteration function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConcurrencyContext {
    /// Sequence number of the iteration within the run
    pub iteration: u64,
    /// Worker index under FixedPool; arrival-rate iterations have no fixed worker
    pub worker: Option<usize>,
}

/// What the scheduler did during a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Start signals produced (arrivals under ConstantArrivalRate)
    pub issued: u64,
    pub started: u64,
    pub completed: u64,
    pub dropped: u64,
    pub interrupted: u64,
    pub peak_in_flight: usize,
}

#[derive(Default)]
struct Counters {
    issued: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    dropped: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Counters {
    /// Mark an iteration as running until the guard drops (also on abort)
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.started.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }

    fn stats(&self, interrupted: u64) -> SchedulerStats {
        SchedulerStats {
            issued: self.issued.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            interrupted,
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }
}

struct InFlightGuard(Arc<Counters>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A queued arrival waiting for a worker. Counted as dropped unless admitted,
/// including when its task is aborted while waiting.
struct QueuedArrival {
    counters: Arc<Counters>,
    queued: Arc<AtomicUsize>,
    admitted: bool,
}

impl QueuedArrival {
    fn enter(counters: &Arc<Counters>, queued: &Arc<AtomicUsize>) -> Self {
        queued.fetch_add(1, Ordering::SeqCst);
        Self {
            counters: counters.clone(),
            queued: queued.clone(),
            admitted: false,
        }
    }

    fn admit(mut self) {
        self.admitted = true;
    }
}

impl Drop for QueuedArrival {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        if !self.admitted {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Turns a [`ConcurrencyPolicy`] into iteration starts
pub struct RateScheduler {
    policy: ConcurrencyPolicy,
    options: SchedulerOptions,
    shutdown: Option<watch::Receiver<bool>>,
}

impl RateScheduler {
    /// Fails with `InvalidPolicy` for a zero or negative rate, duration or worker count
    pub fn new(policy: ConcurrencyPolicy, options: SchedulerOptions) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            options,
            shutdown: None,
        })
    }

    /// Stop issuing iterations once `true` is sent on this channel
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn policy(&self) -> &ConcurrencyPolicy {
        &self.policy
    }

    /// Drive `iteration` according to the policy until the run is over and
    /// in-flight iterations have drained (or been cut off by the hard stop).
    pub async fn drive<F, Fut>(&self, iteration: F) -> SchedulerStats
    where
        F: Fn(ConcurrencyContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let counters = Arc::new(Counters::default());

        tracing::info!(policy = %self.policy, "Starting scheduler");
        let handles = match self.policy {
            ConcurrencyPolicy::FixedPool { count, duration } => {
                self.fixed_pool(count, duration, &counters, iteration).await
            }
            ConcurrencyPolicy::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                pre_allocated_workers,
            } => {
                self.constant_arrival_rate(
                    rate,
                    time_unit,
                    duration,
                    pre_allocated_workers,
                    &counters,
                    iteration,
                )
                .await
            }
        };

        let interrupted = self.drain(handles, &counters).await;
        let stats = counters.stats(interrupted);

        if stats.dropped > 0 {
            tracing::warn!(
                dropped = stats.dropped,
                workers = self.policy.max_workers(),
                "Iterations dropped: no free worker at arrival time"
            );
        }
        if stats.interrupted > 0 {
            tracing::warn!(
                interrupted = stats.interrupted,
                "In-flight iterations aborted by hard stop"
            );
        }
        tracing::info!(
            issued = stats.issued,
            started = stats.started,
            completed = stats.completed,
            peak_in_flight = stats.peak_in_flight,
            "Scheduler finished"
        );

        stats
    }

    /// Spawn the pool and return once the run window is over
    async fn fixed_pool<F, Fut>(
        &self,
        count: usize,
        duration: Duration,
        counters: &Arc<Counters>,
        iteration: F,
    ) -> Vec<JoinHandle<()>>
    where
        F: Fn(ConcurrencyContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + duration;
        let sequence = Arc::new(AtomicU64::new(0));

        let handles = (0..count)
            .map(|worker| {
                let iteration = iteration.clone();
                let counters = counters.clone();
                let sequence = sequence.clone();
                let shutdown = self.shutdown.clone();

                tokio::spawn(async move {
                    while Instant::now() < deadline && !is_shutdown(&shutdown) {
                        let ctx = ConcurrencyContext {
                            iteration: sequence.fetch_add(1, Ordering::Relaxed),
                            worker: Some(worker),
                        };
                        counters.issued.fetch_add(1, Ordering::Relaxed);
                        let _guard = counters.enter();
                        iteration(ctx).await;
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        tokio::select! {
            _ = sleep_until(deadline) => {}
            _ = shutdown_requested(self.shutdown.clone()) => {
                tracing::info!("Shutdown requested, no new iterations will start");
            }
        }

        handles
    }

    /// Run the issuing loop until the run window is over
    async fn constant_arrival_rate<F, Fut>(
        &self,
        rate: f64,
        time_unit: Duration,
        duration: Duration,
        workers: usize,
        counters: &Arc<Counters>,
        iteration: F,
    ) -> Vec<JoinHandle<()>>
    where
        F: Fn(ConcurrencyContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let start = Instant::now();
        let deadline = start + duration;
        let unit_secs = time_unit.as_secs_f64();
        let window_secs = duration.as_secs_f64();
        let permits = Arc::new(Semaphore::new(workers));
        let queued = Arc::new(AtomicUsize::new(0));
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut arrival: u64 = 0;

        loop {
            // Offsets are computed from the start, so sleep overshoot never accumulates.
            // Compared in f64 first: tiny rates put later offsets beyond what Duration holds.
            let offset = unit_secs * arrival as f64 / rate;
            if offset >= window_secs {
                break;
            }
            let at = start + Duration::from_secs_f64(offset);

            tokio::select! {
                _ = sleep_until(at) => {}
                _ = shutdown_requested(self.shutdown.clone()) => {
                    tracing::info!("Shutdown requested, no new iterations will start");
                    break;
                }
            }

            counters.issued.fetch_add(1, Ordering::Relaxed);
            let ctx = ConcurrencyContext {
                iteration: arrival,
                worker: None,
            };
            arrival += 1;

            match permits.clone().try_acquire_owned() {
                Ok(permit) => {
                    let iteration = iteration.clone();
                    let counters = counters.clone();
                    handles.push(tokio::spawn(async move {
                        let _guard = counters.enter();
                        iteration(ctx).await;
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                        drop(permit);
                    }));
                }
                Err(TryAcquireError::NoPermits) => match self.options.overflow {
                    ArrivalOverflow::Queue { capacity } if queued.load(Ordering::SeqCst) < capacity => {
                        let slot = QueuedArrival::enter(counters, &queued);
                        let iteration = iteration.clone();
                        let counters = counters.clone();
                        let permits = permits.clone();
                        let shutdown = self.shutdown.clone();
                        handles.push(tokio::spawn(async move {
                            let permit = permits.acquire_owned().await;
                            // A queued arrival must not start once the run is over
                            let permit = match permit {
                                Ok(p) if Instant::now() < deadline && !is_shutdown(&shutdown) => {
                                    slot.admit();
                                    p
                                }
                                _ => return,
                            };
                            let _guard = counters.enter();
                            iteration(ctx).await;
                            counters.completed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }));
                    }
                    _ => {
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(arrival = ctx.iteration, "No free worker, arrival dropped");
                    }
                },
                Err(TryAcquireError::Closed) => break,
            }

            if handles.len() >= workers.saturating_mul(4).max(64) {
                handles.retain(|h| !h.is_finished());
            }
        }

        handles
    }

    /// Wait for in-flight iterations. Returns how many were aborted.
    async fn drain(&self, handles: Vec<JoinHandle<()>>, counters: &Arc<Counters>) -> u64 {
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let all = join_all(handles);
        tokio::pin!(all);

        match self.options.hard_stop {
            None => {
                all.await;
                0
            }
            Some(grace) => {
                tokio::select! {
                    _ = &mut all => 0,
                    _ = sleep(grace) => {
                        let interrupted = counters.in_flight.load(Ordering::SeqCst) as u64;
                        for handle in aborts {
                            handle.abort();
                        }
                        // Aborted tasks release their guards once they unwind
                        all.await;
                        interrupted
                    }
                }
            }
        }
    }
}

fn is_shutdown(shutdown: &Option<watch::Receiver<bool>>) -> bool {
    shutdown.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
}

/// Resolves once shutdown is requested; never resolves without a channel
/// or when the sender goes away without requesting it.
async fn shutdown_requested(shutdown: Option<watch::Receiver<bool>>) {
    if let Some(mut rx) = shutdown {
        if rx.wait_for(|stop| *stop).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}
