//! Iteration runner and the `run` entry point.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use crate::checks::CheckSet;
use crate::error::{LoadError, Result};
use crate::http_client::Executor;
use crate::metrics::Aggregator;
use crate::models::RequestSpec;
use crate::report::RunSummary;
use crate::scheduler::{ConcurrencyContext, ConcurrencyPolicy, RateScheduler, SchedulerOptions};

/// Everything a run needs. Immutable once the run starts.
#[derive(Debug, Clone)]
pub struct TestDefinition {
    pub name: String,
    pub request: RequestSpec,
    pub checks: CheckSet,
    pub policy: ConcurrencyPolicy,
    pub options: SchedulerOptions,
    /// Unrecorded iterations executed before the measured run
    pub warmup_iterations: usize,
}

/// Executes single iterations: call, score, record
pub struct IterationRunner<E> {
    request: Arc<RequestSpec>,
    checks: Arc<CheckSet>,
    executor: Arc<E>,
    aggregator: Arc<Aggregator>,
}

impl<E> Clone for IterationRunner<E> {
    fn clone(&self) -> Self {
        Self {
            request: self.request.clone(),
            checks: self.checks.clone(),
            executor: self.executor.clone(),
            aggregator: self.aggregator.clone(),
        }
    }
}

impl<E: Executor> IterationRunner<E> {
    pub fn new(
        request: Arc<RequestSpec>,
        checks: Arc<CheckSet>,
        executor: Arc<E>,
        aggregator: Arc<Aggregator>,
    ) -> Self {
        Self {
            request,
            checks,
            executor,
            aggregator,
        }
    }

    /// Run one iteration. Transport failures are recorded, never returned.
    pub async fn run_once(&self, ctx: ConcurrencyContext) {
        let variables = self.request.resolve_variables(&ctx);
        let start = Instant::now();

        match self.executor.execute(&self.request, &variables).await {
            Ok(result) => {
                self.aggregator.record_latency(result.elapsed);
                for outcome in self.checks.evaluate(&result).iter() {
                    self.aggregator.record(outcome.name, outcome.passed);
                }
            }
            Err(e) => {
                // Failed iterations are timed up to the failure
                let elapsed = start.elapsed();
                tracing::debug!(
                    iteration = ctx.iteration,
                    error_kind = %e.kind,
                    error = %e.message,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Iteration failed"
                );
                self.aggregator.record_latency(elapsed);
                self.aggregator.record_transport_error(e.kind);
                for outcome in self.checks.fail_all().iter() {
                    self.aggregator.record(outcome.name, outcome.passed);
                }
            }
        }

        self.aggregator.record_iteration();
    }

    /// Run warmup iterations sequentially without recording them.
    /// Fails only when every attempt failed to reach the endpoint.
    pub async fn warmup(&self, iterations: usize) -> Result<()> {
        if iterations == 0 {
            return Ok(());
        }

        tracing::info!(iterations, "Running warmup requests");
        let mut last_error = None;
        let mut succeeded = 0usize;

        for i in 0..iterations {
            let ctx = ConcurrencyContext {
                iteration: i as u64,
                worker: None,
            };
            let variables = self.request.resolve_variables(&ctx);
            match self.executor.execute(&self.request, &variables).await {
                Ok(_) => succeeded += 1,
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) if succeeded == 0 => Err(LoadError::Transport(e)),
            Some(e) => {
                tracing::warn!(
                    failed = iterations - succeeded,
                    last_error = %e,
                    "Some warmup requests failed"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Run a test to completion
pub async fn run<E: Executor>(definition: TestDefinition, executor: E) -> Result<RunSummary> {
    run_with_shutdown(definition, executor, None).await
}

/// Run a test; sending `true` on `shutdown` stops issuing new iterations early.
///
/// Setup errors (`InvalidPolicy`, warmup unable to reach the endpoint) are
/// returned before any measured iteration executes. After that the run
/// always produces a summary.
pub async fn run_with_shutdown<E: Executor>(
    definition: TestDefinition,
    executor: E,
    shutdown: Option<watch::Receiver<bool>>,
) -> Result<RunSummary> {
    let TestDefinition {
        name,
        request,
        checks,
        policy,
        options,
        warmup_iterations,
    } = definition;

    let mut scheduler = RateScheduler::new(policy, options)?;
    if let Some(rx) = shutdown {
        scheduler = scheduler.with_shutdown(rx);
    }

    let aggregator = Arc::new(Aggregator::with_checks(checks.names()));
    let runner = IterationRunner::new(
        Arc::new(request),
        Arc::new(checks),
        Arc::new(executor),
        aggregator.clone(),
    );

    runner.warmup(warmup_iterations).await?;

    tracing::info!(name = %name, policy = %policy, "Starting load test");
    let started_at = Utc::now();
    aggregator.start();

    let stats = scheduler
        .drive(move |ctx| {
            let runner = runner.clone();
            async move { runner.run_once(ctx).await }
        })
        .await;

    aggregator.record_dropped(stats.dropped);
    aggregator.record_interrupted(stats.interrupted);
    aggregator.stop();

    let summary = aggregator.summarize(&name, &policy, started_at, stats);

    tracing::info!(
        iterations = summary.iterations,
        elapsed_secs = summary.elapsed_secs,
        failure_rate = summary.check_failure_rate(),
        "Load test finished"
    );

    Ok(summary)
}
