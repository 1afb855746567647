//! Executor lifecycle adapter.
//!
//! The external executor calls [`LifecycleAdapter::perform`] for every job
//! invocation and [`LifecycleAdapter::on_retries_exhausted`] when it gives
//! up on a job. The adapter keeps the persisted job record in step with
//! what actually ran and advances the workflow after each success.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::dispatch::{DispatchReport, ReadyJobDispatcher};
use crate::error::{FlowError, Result};
use crate::events::{EventSink, WorkflowEventPayload};
use crate::job::{JobId, JobRecord};
use crate::registry::HandlerRegistry;
use crate::store::{update_job, PayloadType, PayloadValue, WorkflowStore};
use crate::telemetry;
use crate::workflow::WorkflowId;

/// Failure returned by job logic.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Ordinary failure, left to the executor's retry policy.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
    /// Deliberate terminal failure requested by the job itself.
    #[error("aborted: {0}")]
    Aborted(String),
}

impl From<FlowError> for HandlerError {
    fn from(err: FlowError) -> Self {
        Self::Failed(err.into())
    }
}

/// How a job invocation ended, when it did not raise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Job finished and its successors were evaluated.
    Finished(DispatchReport),
    /// Job finished but the workflow lock could not be taken; successors
    /// are left for reconciliation.
    DispatchAbandoned,
    /// Job aborted itself and is now terminally failed.
    Aborted { reason: String },
}

impl JobOutcome {
    /// Dispatch report of a finished job. An abandoned evaluation yields an
    /// empty report; an abort becomes [`FlowError::Aborted`].
    pub fn into_report(self, job_id: JobId) -> Result<DispatchReport> {
        match self {
            JobOutcome::Finished(report) => Ok(report),
            JobOutcome::DispatchAbandoned => Ok(DispatchReport::default()),
            JobOutcome::Aborted { reason } => Err(FlowError::Aborted { job_id, reason }),
        }
    }
}

/// Per-invocation view handed to job logic.
#[derive(Clone)]
pub struct JobContext {
    job: JobRecord,
    store: Arc<dyn WorkflowStore>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext").field("job", &self.job).finish()
    }
}

impl JobContext {
    pub fn new(job: JobRecord, store: Arc<dyn WorkflowStore>) -> Self {
        Self { job, store }
    }

    pub fn job(&self) -> &JobRecord {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.job.workflow_id
    }

    pub fn job_type(&self) -> &str {
        &self.job.job_type
    }

    pub fn args(&self) -> &[Value] {
        &self.job.args
    }

    /// Deserialize positional argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .job
            .args
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("job {} has no argument {}", self.job.id, index))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Store a payload under this job's type name.
    pub async fn set_payload(&self, value: impl Into<PayloadValue>) -> Result<()> {
        self.set_named_payload(&self.job.job_type, value).await
    }

    pub async fn set_named_payload(&self, name: &str, value: impl Into<PayloadValue>) -> Result<()> {
        self.store
            .set_payload(self.job.workflow_id, name, &value.into())
            .await
    }

    /// Read a payload written by another job of this workflow.
    pub async fn payload(&self, name: &str, kind: PayloadType) -> Result<Option<PayloadValue>> {
        self.store.get_payload(self.job.workflow_id, name, kind).await
    }

    /// Build the error that fails this job terminally.
    ///
    /// ```ignore
    /// return Err(ctx.abort("input file is empty"));
    /// ```
    pub fn abort(&self, reason: impl Into<String>) -> HandlerError {
        HandlerError::Aborted(reason.into())
    }
}

/// Wraps every executor invocation with the lifecycle hooks.
#[derive(Clone)]
pub struct LifecycleAdapter {
    store: Arc<dyn WorkflowStore>,
    dispatcher: ReadyJobDispatcher,
    registry: Arc<HandlerRegistry>,
    events: EventSink,
}

impl std::fmt::Debug for LifecycleAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleAdapter")
            .field("registry", &self.registry)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl LifecycleAdapter {
    pub fn new(dispatcher: ReadyJobDispatcher, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            store: dispatcher.store().clone(),
            events: dispatcher.events().clone(),
            dispatcher,
            registry,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Run one invocation of `job_id`: start hook, handler, then the
    /// success, error or abort hook.
    ///
    /// A handler failure is recorded and returned as
    /// [`FlowError::Execution`] so the executor can retry. An abort is
    /// recorded and reported as [`JobOutcome::Aborted`] without an error.
    pub async fn perform(&self, job_id: JobId) -> Result<JobOutcome> {
        let job = self.store.load_job(job_id).await?;
        let handler = self.registry.resolve(&job.job_type)?;
        let job = self.on_start(job_id).await?;
        let job_type = job.job_type.clone();
        let ctx = JobContext::new(job, self.store.clone());

        let result = telemetry::instrument_perform(job_id.to_string(), &job_type, handler.perform(&ctx)).await;

        match result {
            Ok(()) => self.on_success(job_id).await,
            Err(HandlerError::Aborted(reason)) => {
                self.on_abort(job_id, &reason).await?;
                Ok(JobOutcome::Aborted { reason })
            }
            Err(HandlerError::Failed(err)) => {
                let message = format!("{err:#}");
                self.on_error(job_id, &message).await?;
                Err(FlowError::Execution { job_id, message })
            }
        }
    }

    /// Mark the job enqueued unless it already is.
    pub async fn on_enqueue(&self, job_id: JobId) -> Result<JobRecord> {
        let (job, _) = update_job(self.store.as_ref(), job_id, JobRecord::enqueue).await?;
        Ok(job)
    }

    /// Mark the job started unless it already is.
    pub async fn on_start(&self, job_id: JobId) -> Result<JobRecord> {
        let (job, changed) = update_job(self.store.as_ref(), job_id, JobRecord::mark_started).await?;
        if changed {
            self.events
                .emit(
                    job.workflow_id,
                    WorkflowEventPayload::Started {
                        job_id,
                        job_type: job.job_type.clone(),
                    },
                )
                .await;
        }
        Ok(job)
    }

    /// Mark the job finished, persist it, then dispatch ready successors.
    pub async fn on_success(&self, job_id: JobId) -> Result<JobOutcome> {
        let mut job = self.store.load_job(job_id).await?;
        job.mark_finished();
        self.store.save_job(&job).await?;
        telemetry::record_job_outcome(job_id.to_string(), &job.job_type, "finished");
        self.events
            .emit(
                job.workflow_id,
                WorkflowEventPayload::Finished {
                    job_id,
                    job_type: job.job_type.clone(),
                },
            )
            .await;

        match self.dispatcher.dispatch_ready(&job).await {
            Ok(report) => Ok(JobOutcome::Finished(report)),
            Err(FlowError::LockTimeout { key, .. }) => {
                warn!(
                    job_id = %job_id,
                    workflow_id = %job.workflow_id,
                    key = %key,
                    "successor dispatch abandoned; reconcile the workflow to recover"
                );
                Ok(JobOutcome::DispatchAbandoned)
            }
            Err(err) => Err(err),
        }
    }

    /// Record a failed attempt. Successors are not evaluated.
    pub async fn on_error(&self, job_id: JobId, message: &str) -> Result<JobRecord> {
        let mut job = self.store.load_job(job_id).await?;
        job.record_error(message);
        self.store.save_job(&job).await?;
        telemetry::record_job_outcome(job_id.to_string(), &job.job_type, "error");
        self.events
            .emit(
                job.workflow_id,
                WorkflowEventPayload::Errored {
                    job_id,
                    job_type: job.job_type.clone(),
                    message: message.to_string(),
                },
            )
            .await;
        Ok(job)
    }

    /// Terminal failure requested by the job itself.
    pub async fn on_abort(&self, job_id: JobId, reason: &str) -> Result<JobRecord> {
        let mut job = self.store.load_job(job_id).await?;
        job.record_error(reason);
        job.fail();
        self.store.save_job(&job).await?;
        info!(job_id = %job_id, reason = %reason, "job aborted");
        telemetry::record_job_outcome(job_id.to_string(), &job.job_type, "aborted");
        self.emit_failed(&job, reason).await;
        Ok(job)
    }

    /// Terminal failure after the executor's retry budget ran out.
    pub async fn on_retries_exhausted(&self, job_id: JobId) -> Result<JobRecord> {
        let mut job = self.store.load_job(job_id).await?;
        job.fail();
        self.store.save_job(&job).await?;
        telemetry::record_job_outcome(job_id.to_string(), &job.job_type, "failed");
        self.emit_failed(&job, "retries exhausted").await;
        Ok(job)
    }

    async fn emit_failed(&self, job: &JobRecord, reason: &str) {
        self.events
            .emit(
                job.workflow_id,
                WorkflowEventPayload::Failed {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                    reason: reason.to_string(),
                },
            )
            .await;
    }
}
