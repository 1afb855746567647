use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::store::WorkflowStore;
use crate::workflow::WorkflowId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Current wall clock, truncated to the microsecond resolution the stores
/// persist.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Status derived from which lifecycle timestamps are present.
///
/// Ordered by terminality; when several timestamps are set the highest
/// variant wins except that `Failed` always overrides `Finished`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Enqueued,
    Started,
    Error,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Enqueued => "enqueued",
            JobStatus::Started => "started",
            JobStatus::Error => "error",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }

    /// Display word used by status overviews.
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Enqueued => "Enqueued",
            JobStatus::Started => "Running",
            JobStatus::Error => "Retrying",
            JobStatus::Finished => "Succeeded",
            JobStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed execution attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// A unit of work and its position in the workflow graph.
///
/// `before` holds successors (jobs waiting on this one), `after` holds
/// predecessors. Both are resolved by the workflow builder and are the
/// transpose of each other across the workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub workflow_id: WorkflowId,
    pub job_type: String,
    pub args: Vec<Value>,
    pub before: BTreeSet<JobId>,
    pub after: BTreeSet<JobId>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub errors: Vec<ErrorEntry>,
}

impl JobRecord {
    pub fn new(workflow_id: WorkflowId, job_type: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id: JobId::new(),
            workflow_id,
            job_type: job_type.into(),
            args,
            before: BTreeSet::new(),
            after: BTreeSet::new(),
            enqueued_at: None,
            started_at: None,
            finished_at: None,
            error_at: None,
            failed_at: None,
            errors: Vec::new(),
        }
    }

    pub fn status(&self) -> JobStatus {
        if self.failed_at.is_some() {
            JobStatus::Failed
        } else if self.finished_at.is_some() {
            JobStatus::Finished
        } else if self.error_at.is_some() {
            JobStatus::Error
        } else if self.started_at.is_some() {
            JobStatus::Started
        } else if self.enqueued_at.is_some() {
            JobStatus::Enqueued
        } else {
            JobStatus::Pending
        }
    }

    /// A job with no predecessors.
    pub fn is_initial(&self) -> bool {
        self.after.is_empty()
    }

    pub fn is_enqueued(&self) -> bool {
        self.enqueued_at.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.status() == JobStatus::Finished
    }

    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Dispatch gate evaluated against already-loaded predecessor records.
    ///
    /// `lookup` resolves a predecessor id; a predecessor it cannot resolve
    /// counts as not finished.
    pub fn enqueueable_with<'a, F>(&self, lookup: F) -> bool
    where
        F: Fn(&JobId) -> Option<&'a JobRecord>,
    {
        self.enqueued_at.is_none()
            && self
                .after
                .iter()
                .all(|id| lookup(id).is_some_and(|job| job.status() == JobStatus::Finished))
    }

    /// Dispatch gate evaluated against predecessor state freshly read from
    /// `store`.
    pub async fn enqueueable(&self, store: &dyn WorkflowStore) -> Result<bool> {
        if self.enqueued_at.is_some() {
            return Ok(false);
        }
        if self.after.is_empty() {
            return Ok(true);
        }
        let ids: Vec<JobId> = self.after.iter().copied().collect();
        let predecessors = store.load_jobs(&ids).await?;
        Ok(self.enqueueable_with(|id| predecessors.get(id)))
    }

    /// Returns false when the job was already enqueued.
    pub fn enqueue(&mut self) -> bool {
        if self.enqueued_at.is_some() {
            return false;
        }
        self.enqueued_at = Some(timestamp_now());
        true
    }

    /// Returns false when the job had already started.
    pub fn mark_started(&mut self) -> bool {
        if self.started_at.is_some() {
            return false;
        }
        self.started_at = Some(timestamp_now());
        true
    }

    pub fn mark_finished(&mut self) {
        self.finished_at = Some(timestamp_now());
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        let now = timestamp_now();
        self.errors.push(ErrorEntry {
            timestamp: now,
            message: message.into(),
        });
        self.error_at = Some(now);
    }

    pub fn fail(&mut self) {
        self.failed_at = Some(timestamp_now());
    }

    /// Clears the terminal failure marker. Returns false when the job was
    /// not failed.
    pub fn clear_failure(&mut self) -> bool {
        self.failed_at.take().is_some()
    }
}
