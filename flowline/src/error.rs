use std::time::Duration;

use thiserror::Error;

use crate::job::JobId;
use crate::workflow::WorkflowId;

/// Errors surfaced by the orchestration core.
///
/// NotFound variants are fatal to the calling operation and never retried
/// internally. Store failures are propagated as [`FlowError::StoreUnavailable`]
/// without automatic retry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FlowError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("timed out acquiring lock `{key}` after {waited:?}")]
    LockTimeout { key: String, waited: Duration },

    #[error("job {job_id} failed: {message}")]
    Execution { job_id: JobId, message: String },

    #[error("job {job_id} aborted: {reason}")]
    Aborted { job_id: JobId, reason: String },

    #[error("edge {from} -> {to} references a job that is not part of the workflow")]
    InvalidEdge { from: JobId, to: JobId },

    #[error("dependency cycle detected involving job {job_id}")]
    CycleDetected { job_id: JobId },

    #[error("no handler registered for job type `{0}`")]
    UnknownJobType(String),

    #[error("corrupt record at `{key}`: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("payload `{name}` could not be decoded as {expected}")]
    PayloadDecode { name: String, expected: &'static str },

    #[error("executor rejected job {job_id}: {source}")]
    Executor {
        job_id: JobId,
        #[source]
        source: anyhow::Error,
    },

    #[error("workflow {workflow_id} still running after {waited:?}")]
    WaitTimeout { workflow_id: WorkflowId, waited: Duration },

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl FlowError {
    /// Wrap any backend failure as a store outage.
    pub fn store(err: impl Into<anyhow::Error>) -> Self {
        Self::StoreUnavailable(err.into())
    }

    pub(crate) fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// True for the NotFound family.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::WorkflowNotFound(_) | Self::JobNotFound(_))
    }
}

pub type Result<T, E = FlowError> = std::result::Result<T, E>;
