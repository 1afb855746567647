//! Prometheus metrics instrumentation for flowline.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `flowline_jobs_dispatched_total` - Jobs handed to the executor
//! - `flowline_job_outcomes_total` - Job invocations by outcome
//! - `flowline_lock_timeouts_total` - Ready-job evaluations abandoned on lock timeout
//!
//! ## Histograms
//! - `flowline_ready_evaluation_seconds` - Duration of locked ready-job evaluations
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for flowline metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for jobs handed to the executor.
///
/// Labels:
/// - `job_type`: The job type
pub static JOBS_DISPATCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "flowline_jobs_dispatched_total",
        "Total number of jobs handed to the executor",
    );
    CounterVec::new(opts, &["job_type"]).expect("flowline_jobs_dispatched_total metric creation failed")
});

/// Counter for job invocation outcomes.
///
/// Labels:
/// - `job_type`: The job type
/// - `outcome`: finished, error, aborted, failed
pub static JOB_OUTCOMES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("flowline_job_outcomes_total", "Total number of job outcomes");
    CounterVec::new(opts, &["job_type", "outcome"]).expect("flowline_job_outcomes_total metric creation failed")
});

pub static LOCK_TIMEOUTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "flowline_lock_timeouts_total",
        "Ready-job evaluations abandoned because the workflow lock was held",
    )
    .expect("flowline_lock_timeouts_total metric creation failed")
});

pub static READY_EVALUATION_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.0005, 2.0, 14).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "flowline_ready_evaluation_seconds",
        "Duration of locked ready-job evaluations in seconds",
    )
    .buckets(buckets);
    Histogram::with_opts(opts).expect("flowline_ready_evaluation_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_DISPATCHED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOB_OUTCOMES_TOTAL.clone()),
        Box::new(LOCK_TIMEOUTS_TOTAL.clone()),
        Box::new(READY_EVALUATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_dispatched(job_type: &str) {
    JOBS_DISPATCHED_TOTAL.with_label_values(&[job_type]).inc();
}

pub fn record_job_outcome(job_type: &str, outcome: &str) {
    JOB_OUTCOMES_TOTAL.with_label_values(&[job_type, outcome]).inc();
}

pub fn record_lock_timeout() {
    LOCK_TIMEOUTS_TOTAL.inc();
}

pub fn observe_ready_evaluation(duration_secs: f64) {
    READY_EVALUATION_SECONDS.observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder.encode_to_string(&metric_families).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization_is_idempotent() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_dispatched("fetch");
        record_job_outcome("fetch", "finished");
        record_lock_timeout();
        observe_ready_evaluation(0.002);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("flowline_jobs_dispatched_total"));
        assert!(output.contains("flowline_job_outcomes_total"));
        assert!(output.contains("flowline_lock_timeouts_total"));
        assert!(output.contains("flowline_ready_evaluation_seconds"));
    }
}
