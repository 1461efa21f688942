//! Concurrent load generation against a shared connection
//!
//! Runs a fixed number of workers that call an operation back to back, either
//! until a request budget is spent or until a duration elapses, and collects
//! latency statistics.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Load test parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StressConfig {
    /// Number of concurrent workers
    pub concurrency: usize,

    /// How long to run when `requests` is 0
    pub duration: Duration,

    /// Total number of requests; 0 runs for `duration` instead
    pub requests: u64,

    /// Bound applied to each request
    pub timeout: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            duration: Duration::from_secs(30),
            requests: 0,
            timeout: Duration::from_secs(10),
        }
    }
}

/// How a single request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation returned `Ok`
    Success,
    /// The operation returned an error
    Failure,
    /// The operation exceeded the per-request timeout
    Timeout,
}

#[derive(Debug)]
struct StatsInner {
    total: u64,
    succeeded: u64,
    failed: u64,
    timed_out: u64,
    total_latency: Duration,
    min_latency: Option<Duration>,
    max_latency: Duration,
}

/// Thread-safe latency and outcome accumulator
#[derive(Debug)]
pub struct StressStats {
    inner: Mutex<StatsInner>,
}

impl Default for StressStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StressStats {
    /// Create empty statistics
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                total: 0,
                succeeded: 0,
                failed: 0,
                timed_out: 0,
                total_latency: Duration::ZERO,
                min_latency: None,
                max_latency: Duration::ZERO,
            }),
        }
    }

    /// Record one request
    pub fn record(&self, latency: Duration, outcome: Outcome) {
        let mut inner = self.inner.lock();
        inner.total += 1;
        match outcome {
            Outcome::Success => inner.succeeded += 1,
            Outcome::Failure => inner.failed += 1,
            Outcome::Timeout => inner.timed_out += 1,
        }
        inner.total_latency += latency;
        inner.min_latency = Some(inner.min_latency.map_or(latency, |min| min.min(latency)));
        inner.max_latency = inner.max_latency.max(latency);
    }

    /// Summarize everything recorded over `elapsed`
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn report(&self, elapsed: Duration) -> StressReport {
        let inner = self.inner.lock();
        let avg_latency = u32::try_from(inner.total)
            .ok()
            .filter(|total| *total > 0)
            .map_or(Duration::ZERO, |total| inner.total_latency / total);
        let requests_per_second = if elapsed.is_zero() {
            0.0
        } else {
            inner.total as f64 / elapsed.as_secs_f64()
        };
        let success_rate = if inner.total == 0 {
            0.0
        } else {
            inner.succeeded as f64 / inner.total as f64 * 100.0
        };

        StressReport {
            total: inner.total,
            succeeded: inner.succeeded,
            failed: inner.failed,
            timed_out: inner.timed_out,
            success_rate,
            avg_latency,
            min_latency: inner.min_latency.unwrap_or_default(),
            max_latency: inner.max_latency,
            elapsed,
            requests_per_second,
        }
    }
}

/// Summary of a finished load test
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StressReport {
    /// Requests issued
    pub total: u64,
    /// Requests that succeeded
    pub succeeded: u64,
    /// Requests that returned an error
    pub failed: u64,
    /// Requests that exceeded the per-request timeout
    pub timed_out: u64,
    /// Percentage of successful requests
    pub success_rate: f64,
    /// Mean latency
    #[serde(with = "humantime_serde")]
    pub avg_latency: Duration,
    /// Fastest request
    #[serde(with = "humantime_serde")]
    pub min_latency: Duration,
    /// Slowest request
    #[serde(with = "humantime_serde")]
    pub max_latency: Duration,
    /// Wall-clock length of the run
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Throughput
    pub requests_per_second: f64,
}

impl fmt::Display for StressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total == 0 {
            return writeln!(f, "No requests completed");
        }

        writeln!(f, "=== Stress Test Results ===")?;
        writeln!(f, "Total Requests:     {}", self.total)?;
        writeln!(
            f,
            "Successful:         {} ({:.2}%)",
            self.succeeded, self.success_rate
        )?;
        writeln!(
            f,
            "Failed:             {} ({:.2}%)",
            self.failed + self.timed_out,
            100.0 - self.success_rate
        )?;
        writeln!(f, "  Timed out:        {}", self.timed_out)?;
        writeln!(f)?;
        writeln!(f, "Response Times:")?;
        writeln!(f, "  Average:          {:?}", self.avg_latency)?;
        writeln!(f, "  Min:              {:?}", self.min_latency)?;
        writeln!(f, "  Max:              {:?}", self.max_latency)?;
        writeln!(f)?;
        writeln!(f, "Requests per second: {:.2}", self.requests_per_second)
    }
}

/// Run a load test until the budget or duration is exhausted
pub async fn run<F, Fut, E>(config: StressConfig, op: F) -> StressReport
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let (_never, stop) = watch::channel(false);
    run_until(config, op, stop).await
}

/// [`run`] that also ends early once `stop` turns `true`
pub async fn run_until<F, Fut, E>(
    config: StressConfig,
    op: F,
    stop: watch::Receiver<bool>,
) -> StressReport
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    info!(
        "Starting stress test: concurrency={}, requests={}, duration={:?}, timeout={:?}",
        config.concurrency, config.requests, config.duration, config.timeout
    );

    let op = Arc::new(op);
    let stats = Arc::new(StressStats::new());
    let issued = Arc::new(AtomicU64::new(0));
    let started = Instant::now();
    let deadline = (config.requests == 0).then(|| started + config.duration);

    let workers = (0..config.concurrency.max(1)).map(|worker| {
        let op = Arc::clone(&op);
        let stats = Arc::clone(&stats);
        let issued = Arc::clone(&issued);
        let stop = stop.clone();

        tokio::spawn(async move {
            loop {
                if *stop.borrow() {
                    break;
                }
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    break;
                }
                if config.requests > 0 && issued.fetch_add(1, Ordering::SeqCst) >= config.requests
                {
                    break;
                }

                let request_started = Instant::now();
                let outcome = match timeout(config.timeout, op()).await {
                    Ok(Ok(())) => Outcome::Success,
                    Ok(Err(e)) => {
                        debug!("Worker {} request failed: {}", worker, e);
                        Outcome::Failure
                    }
                    Err(_) => Outcome::Timeout,
                };
                stats.record(request_started.elapsed(), outcome);
            }
        })
    });

    for result in join_all(workers).await {
        if let Err(e) = result {
            warn!("Stress worker panicked: {}", e);
        }
    }

    let report = stats.report(started.elapsed());
    info!(
        "Stress test finished: {} requests, {} succeeded",
        report.total, report.succeeded
    );
    report
}
