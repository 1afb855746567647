use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::keys::Keyspace;
use super::record::{self, Fields, WorkflowHeader};
use super::{PayloadValue, WorkflowStore};
use crate::config::StoreConfig;
use crate::error::{FlowError, Result};
use crate::job::{JobId, JobRecord};
use crate::workflow::{Workflow, WorkflowId};

#[derive(Clone, Debug)]
struct Entry {
    fields: Fields,
    expires_at: Instant,
}

/// Process-local store laid out like a hash-per-key database.
///
/// Each workflow, job and payload namespace is a field map under its own
/// key with an expiry refreshed on every write. Expired keys read as
/// absent. Cloning shares the underlying map.
#[derive(Clone)]
pub struct InMemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    keys: Keyspace,
    ttl: Duration,
    unavailable: Arc<AtomicBool>,
    writes_before_outage: Arc<Mutex<Option<usize>>>,
    writes: Arc<AtomicUsize>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("keys", &self.entries.lock().len())
            .field("prefix", &self.keys.prefix())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl InMemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            keys: Keyspace::new(config.key_prefix.clone()),
            ttl: config.ttl(),
            unavailable: Arc::new(AtomicBool::new(false)),
            writes_before_outage: Arc::new(Mutex::new(None)),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keys
    }

    /// Simulate an outage: every subsequent call fails with
    /// [`FlowError::StoreUnavailable`] until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
        if !unavailable {
            *self.writes_before_outage.lock() = None;
        }
    }

    /// Allow `writes` more successful writes, then go unavailable.
    pub fn fail_after_writes(&self, writes: usize) {
        *self.writes_before_outage.lock() = Some(writes);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Raw field map stored under `key`, if present and not expired.
    pub fn raw_fields(&self, key: &str) -> Option<Fields> {
        self.read(key)
    }

    /// Remaining lifetime of `key`.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        entry.expires_at.checked_duration_since(Instant::now())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FlowError::store(anyhow::anyhow!("in-memory store marked unavailable")));
        }
        Ok(())
    }

    fn read(&self, key: &str) -> Option<Fields> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.fields.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn write(&self, key: String, fields: Fields) -> Result<()> {
        self.write_with(key, |_| fields)
    }

    /// Replace the entry under `key` with `update(current)` while holding
    /// the map lock.
    fn write_with(&self, key: String, update: impl FnOnce(Option<Fields>) -> Fields) -> Result<()> {
        self.check_available()?;
        {
            let mut budget = self.writes_before_outage.lock();
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    self.unavailable.store(true, Ordering::SeqCst);
                    return Err(FlowError::store(anyhow::anyhow!("in-memory store write budget exhausted")));
                }
                *remaining -= 1;
            }
        }
        let now = Instant::now();
        let expires_at = now
            .checked_add(self.ttl)
            .ok_or_else(|| FlowError::Configuration(format!("record ttl {:?} is out of range", self.ttl)))?;
        let mut entries = self.entries.lock();
        let current = entries
            .remove(&key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.fields);
        let fields = update(current);
        entries.insert(
            key,
            Entry {
                fields,
                expires_at,
            },
        );
        drop(entries);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let header = WorkflowHeader {
            id: workflow.id,
            workflow_type: workflow.workflow_type.clone(),
            job_ids: workflow.job_ids(),
        };
        self.write(self.keys.workflow(workflow.id), record::encode_workflow(&header))?;
        for job in workflow.jobs.values() {
            self.save_job(job).await?;
        }
        Ok(())
    }

    async fn load_workflow(&self, id: WorkflowId) -> Result<Workflow> {
        self.check_available()?;
        let key = self.keys.workflow(id);
        let fields = self.read(&key).ok_or(FlowError::WorkflowNotFound(id))?;
        let header = record::decode_workflow(&key, id, &fields)?;
        let jobs = self.load_jobs(&header.job_ids).await?;
        Ok(Workflow {
            id,
            workflow_type: header.workflow_type,
            jobs: jobs.into_iter().collect(),
        })
    }

    async fn save_job(&self, job: &JobRecord) -> Result<()> {
        self.write(self.keys.job(job.id), record::encode_job(job)?)
    }

    async fn load_job(&self, id: JobId) -> Result<JobRecord> {
        self.check_available()?;
        let key = self.keys.job(id);
        let fields = self.read(&key).ok_or(FlowError::JobNotFound(id))?;
        record::decode_job(&key, id, &fields)
    }

    async fn set_payload(&self, workflow_id: WorkflowId, name: &str, value: &PayloadValue) -> Result<()> {
        let encoded = value.encode()?;
        self.write_with(self.keys.payload(workflow_id), |current| {
            let mut fields = current.unwrap_or_default();
            fields.insert(name.to_string(), encoded);
            fields
        })
    }

    async fn get_payload_raw(&self, workflow_id: WorkflowId, name: &str) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self
            .read(&self.keys.payload(workflow_id))
            .and_then(|mut fields| fields.remove(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PayloadType;
    use crate::workflow::{Dependencies, WorkflowBuilder};
    use serde_json::json;

    fn two_step_workflow() -> Workflow {
        let mut builder = WorkflowBuilder::new("two-step");
        let first = builder.register_job("first", vec![json!("a")], Dependencies::none());
        builder.register_job("second", vec![], Dependencies::none().after([first]));
        builder.finalize(true).unwrap()
    }

    #[tokio::test]
    async fn test_workflow_round_trip() {
        let store = InMemoryStore::default();
        let workflow = two_step_workflow();
        store.save_workflow(&workflow).await.unwrap();

        let loaded = store.load_workflow(workflow.id).await.unwrap();
        assert_eq!(loaded, workflow);
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_is_rejected() {
        let store = InMemoryStore::new(StoreConfig {
            ttl_seconds: u64::MAX,
            ..StoreConfig::default()
        });
        let workflow = two_step_workflow();
        let err = store.save_workflow(&workflow).await.unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
        assert!(store.load_workflow(workflow.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_missing_records_are_not_found() {
        let store = InMemoryStore::default();
        let err = store.load_workflow(WorkflowId::new()).await.unwrap_err();
        assert!(matches!(err, FlowError::WorkflowNotFound(_)));
        let err = store.load_job(JobId::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_absent_fields_stay_absent_after_overwrite() {
        let store = InMemoryStore::default();
        let workflow = two_step_workflow();
        store.save_workflow(&workflow).await.unwrap();

        let mut job = workflow.initial_jobs().next().unwrap().clone();
        job.fail();
        store.save_job(&job).await.unwrap();
        job.clear_failure();
        store.save_job(&job).await.unwrap();

        let fields = store.raw_fields(&store.keyspace().job(job.id)).unwrap();
        assert!(!fields.contains_key(record::FAILED_AT));
        assert!(store.load_job(job.id).await.unwrap().failed_at.is_none());
    }

    #[tokio::test]
    async fn test_every_write_sets_ttl() {
        let store = InMemoryStore::new(StoreConfig::default().with_ttl(Duration::from_secs(60)));
        let workflow = two_step_workflow();
        store.save_workflow(&workflow).await.unwrap();

        let ttl = store.ttl_of(&store.keyspace().workflow(workflow.id)).unwrap();
        assert!(ttl <= Duration::from_secs(60) && ttl > Duration::from_secs(50));
        for id in workflow.job_ids() {
            assert!(store.ttl_of(&store.keyspace().job(id)).is_some());
        }
    }

    #[tokio::test]
    async fn test_expired_records_read_as_missing() {
        let store = InMemoryStore::new(StoreConfig::default().with_ttl(Duration::ZERO));
        let workflow = two_step_workflow();
        store.save_workflow(&workflow).await.unwrap();
        assert!(store.load_workflow(workflow.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_partial_save_reports_store_error() {
        let store = InMemoryStore::default();
        let workflow = two_step_workflow();
        store.fail_after_writes(2);

        let err = store.save_workflow(&workflow).await.unwrap_err();
        assert!(matches!(err, FlowError::StoreUnavailable(_)));
        assert_eq!(store.write_count(), 2);

        store.set_unavailable(false);
        assert!(store.raw_fields(&store.keyspace().workflow(workflow.id)).is_some());
    }

    #[tokio::test]
    async fn test_payload_namespace() {
        let store = InMemoryStore::default();
        let id = WorkflowId::new();
        store.set_payload(id, "count", &PayloadValue::Integer(3)).await.unwrap();
        store
            .set_payload(id, "rows", &PayloadValue::Structured(json!([1, 2])))
            .await
            .unwrap();

        let count = store.get_payload(id, "count", PayloadType::Integer).await.unwrap();
        assert_eq!(count, Some(PayloadValue::Integer(3)));
        let rows = store.get_payload(id, "rows", PayloadType::Structured).await.unwrap();
        assert_eq!(rows.unwrap().as_json(), Some(&json!([1, 2])));
        assert_eq!(store.get_payload(id, "missing", PayloadType::Text).await.unwrap(), None);
        assert_eq!(
            store.get_payload(WorkflowId::new(), "count", PayloadType::Integer).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_outage_fails_reads_and_writes() {
        let store = InMemoryStore::default();
        store.set_unavailable(true);
        assert!(matches!(
            store.load_job(JobId::new()).await,
            Err(FlowError::StoreUnavailable(_))
        ));
        assert!(store
            .set_payload(WorkflowId::new(), "x", &PayloadValue::Boolean(true))
            .await
            .is_err());
    }
}
