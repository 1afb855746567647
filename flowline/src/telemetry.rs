//! Tracing and telemetry instrumentation for flowline.
//!
//! Span constructors for the workflow lifecycle plus `record_*` helpers that
//! log an event and, with the `metrics` feature, update the matching
//! Prometheus series. All helpers work with or without the feature.
//!
//! # Example
//!
//! ```ignore
//! use flowline::telemetry::{job_perform_span, record_job_outcome};
//!
//! let span = job_perform_span(job_id, "fetch");
//! let _enter = span.enter();
//! // ... run the job
//! record_job_outcome(job_id, "fetch", "finished");
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info_span, Instrument, Span};
use tracing_subscriber::EnvFilter;

/// Environment variable consulted by [`init_tracing`] before `RUST_LOG`.
pub const LOG_ENV: &str = "FLOWLINE_LOG";

/// Install a formatted subscriber on stderr.
///
/// The filter comes from `FLOWLINE_LOG`, then `RUST_LOG`, then
/// `default_directive`. Returns false when a global subscriber was already
/// installed.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .ok()
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

/// Span covering the creation and initial dispatch of a workflow.
#[must_use]
pub fn workflow_start_span(workflow_id: impl AsRef<str>, workflow_type: impl AsRef<str>) -> Span {
    info_span!(
        "flowline.workflow.start",
        workflow_id = %workflow_id.as_ref(),
        workflow_type = %workflow_type.as_ref(),
    )
}

/// Span covering one execution of a job body by the lifecycle adapter.
#[must_use]
pub fn job_perform_span(job_id: impl AsRef<str>, job_type: impl AsRef<str>) -> Span {
    info_span!(
        "flowline.perform",
        job_id = %job_id.as_ref(),
        job_type = %job_type.as_ref(),
    )
}

/// Span covering one locked ready-job evaluation.
#[must_use]
pub fn ready_evaluation_span(workflow_id: impl AsRef<str>, trigger: impl AsRef<str>) -> Span {
    info_span!(
        "flowline.ready",
        workflow_id = %workflow_id.as_ref(),
        trigger = %trigger.as_ref(),
    )
}

/// Span covering lock acquisition and the guarded section.
#[must_use]
pub fn lock_span(key: impl AsRef<str>) -> Span {
    info_span!("flowline.lock", key = %key.as_ref())
}

/// Attach a perform span to any future.
pub fn instrument_perform<F>(
    job_id: impl AsRef<str>,
    job_type: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let span = job_perform_span(job_id, job_type);
    future.instrument(span)
}

/// Record a job handed to the executor.
pub fn record_job_dispatched(job_id: impl AsRef<str>, job_type: impl AsRef<str>) {
    tracing::info!(
        job_id = %job_id.as_ref(),
        job_type = %job_type.as_ref(),
        "job dispatched"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_dispatched(job_type.as_ref());
}

/// Record how a job invocation ended (finished, error, aborted, failed).
pub fn record_job_outcome(job_id: impl AsRef<str>, job_type: impl AsRef<str>, outcome: impl AsRef<str>) {
    tracing::info!(
        job_id = %job_id.as_ref(),
        job_type = %job_type.as_ref(),
        outcome = %outcome.as_ref(),
        "job outcome recorded"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_outcome(job_type.as_ref(), outcome.as_ref());
}

/// Record a ready-job evaluation abandoned for want of the lock.
pub fn record_lock_timeout(key: impl AsRef<str>, waited: Duration) {
    tracing::warn!(
        key = %key.as_ref(),
        waited_ms = waited.as_millis() as u64,
        "lock acquisition timed out"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_lock_timeout();
}

/// Start timing a ready-job evaluation.
pub fn start_evaluation(workflow_id: impl AsRef<str>) -> EvaluationTimer {
    EvaluationTimer {
        workflow_id: workflow_id.as_ref().to_string(),
        start: Instant::now(),
    }
}

/// Finish timing a ready-job evaluation.
pub fn observe_evaluation(timer: EvaluationTimer, evaluated: usize, dispatched: usize) {
    let duration_secs = timer.start.elapsed().as_secs_f64();
    tracing::debug!(
        workflow_id = %timer.workflow_id,
        evaluated,
        dispatched,
        duration_secs,
        "ready evaluation complete"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_ready_evaluation(duration_secs);
}

/// Opaque timer returned by [`start_evaluation`].
#[derive(Debug)]
pub struct EvaluationTimer {
    workflow_id: String,
    start: Instant,
}

impl EvaluationTimer {
    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            assert_eq!(
                workflow_start_span("wf-1", "nightly").metadata().map(|m| m.name()),
                Some("flowline.workflow.start")
            );
            assert_eq!(
                job_perform_span("job-1", "fetch").metadata().map(|m| m.name()),
                Some("flowline.perform")
            );
            assert_eq!(
                ready_evaluation_span("wf-1", "job-1").metadata().map(|m| m.name()),
                Some("flowline.ready")
            );
            assert_eq!(lock_span("k").metadata().map(|m| m.name()), Some("flowline.lock"));
        });
    }

    #[test]
    fn test_evaluation_timer() {
        let timer = start_evaluation("wf-1");
        assert_eq!(timer.workflow_id(), "wf-1");
        std::thread::sleep(Duration::from_millis(1));
        assert!(timer.elapsed() > Duration::ZERO);
        observe_evaluation(timer, 2, 1);
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_job_dispatched("job-1", "fetch");
        record_job_outcome("job-1", "fetch", "finished");
        record_lock_timeout("workflow::lock::x", Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_instrument_perform_passes_output_through() {
        let out = instrument_perform("job-1", "fetch", async { 5 }).await;
        assert_eq!(out, 5);
    }
}
