//! Durable storage of workflows, job records and per-workflow payloads.
//!
//! Every backend implements [`WorkflowStore`]. Writes are whole-record
//! overwrites that refresh the record's time-to-live; loads fail loudly
//! with a NotFound error instead of returning empty state.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::job::{JobId, JobRecord};
use crate::workflow::{Workflow, WorkflowId};

pub mod keys;
pub mod memory;
pub mod record;

pub use keys::Keyspace;
pub use memory::InMemoryStore;

/// Persistence contract required by the orchestrator.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist workflow metadata followed by every job record.
    ///
    /// Backends without transactions may leave the workflow partially
    /// persisted when a job write fails; the error is still returned.
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()>;

    /// Load a workflow and all of its job records.
    async fn load_workflow(&self, id: WorkflowId) -> Result<Workflow>;

    /// Overwrite a single job record.
    async fn save_job(&self, job: &JobRecord) -> Result<()>;

    /// Load a single job record.
    async fn load_job(&self, id: JobId) -> Result<JobRecord>;

    /// Batch form of [`WorkflowStore::load_job`]. Fails on the first
    /// missing id.
    async fn load_jobs(&self, ids: &[JobId]) -> Result<HashMap<JobId, JobRecord>> {
        let mut jobs = HashMap::with_capacity(ids.len());
        for id in ids {
            jobs.insert(*id, self.load_job(*id).await?);
        }
        Ok(jobs)
    }

    /// Write a value into the workflow's payload namespace.
    async fn set_payload(&self, workflow_id: WorkflowId, name: &str, value: &PayloadValue) -> Result<()>;

    /// Raw stored text of a payload entry, if present.
    async fn get_payload_raw(&self, workflow_id: WorkflowId, name: &str) -> Result<Option<String>>;

    /// Read a payload entry and decode it as `kind`.
    async fn get_payload(
        &self,
        workflow_id: WorkflowId,
        name: &str,
        kind: PayloadType,
    ) -> Result<Option<PayloadValue>> {
        self.get_payload_raw(workflow_id, name)
            .await?
            .map(|raw| kind.decode(name, &raw))
            .transpose()
    }
}

/// Load, mutate and persist a job record.
///
/// `apply` returns whether it changed the record; unchanged records are not
/// written back. Returns the resulting record and the change flag.
pub async fn update_job<F>(store: &dyn WorkflowStore, id: JobId, apply: F) -> Result<(JobRecord, bool)>
where
    F: FnOnce(&mut JobRecord) -> bool + Send,
{
    let mut job = store.load_job(id).await?;
    let changed = apply(&mut job);
    if changed {
        store.save_job(&job).await?;
    }
    Ok((job, changed))
}

/// Decoding applied to a stored payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadType {
    Text,
    Boolean,
    Integer,
    Float,
    Structured,
}

impl PayloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadType::Text => "text",
            PayloadType::Boolean => "boolean",
            PayloadType::Integer => "integer",
            PayloadType::Float => "float",
            PayloadType::Structured => "structured",
        }
    }

    pub fn decode(&self, name: &str, raw: &str) -> Result<PayloadValue> {
        let bad = || FlowError::PayloadDecode {
            name: name.to_string(),
            expected: self.as_str(),
        };
        match self {
            PayloadType::Text => Ok(PayloadValue::Text(raw.to_string())),
            PayloadType::Boolean => match raw.trim() {
                "true" => Ok(PayloadValue::Boolean(true)),
                "false" => Ok(PayloadValue::Boolean(false)),
                _ => Err(bad()),
            },
            PayloadType::Integer => raw.trim().parse().map(PayloadValue::Integer).map_err(|_| bad()),
            PayloadType::Float => raw.trim().parse().map(PayloadValue::Float).map_err(|_| bad()),
            PayloadType::Structured => serde_json::from_str(raw)
                .map(PayloadValue::Structured)
                .map_err(|_| bad()),
        }
    }
}

/// A value in a workflow's payload namespace.
///
/// Scalars are stored as plain text; structured values as JSON.
#[derive(Clone, Debug, PartialEq)]
pub enum PayloadValue {
    Text(String),
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Structured(Value),
}

impl PayloadValue {
    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            PayloadValue::Text(text) => text.clone(),
            PayloadValue::Boolean(flag) => flag.to_string(),
            PayloadValue::Integer(n) => n.to_string(),
            PayloadValue::Float(n) => n.to_string(),
            PayloadValue::Structured(value) => serde_json::to_string(value).map_err(FlowError::store)?,
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PayloadValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PayloadValue::Boolean(flag) => Some(*flag),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PayloadValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PayloadValue::Float(n) => Some(*n),
            PayloadValue::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            PayloadValue::Structured(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for PayloadValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<Value> for PayloadValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => Self::Text(text),
            Value::Bool(flag) => Self::Boolean(flag),
            Value::Number(n) if n.is_i64() => Self::Integer(n.as_i64().unwrap_or_default()),
            Value::Number(n) if n.is_f64() => Self::Float(n.as_f64().unwrap_or_default()),
            other => Self::Structured(other),
        }
    }
}
