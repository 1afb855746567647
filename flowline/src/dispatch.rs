//! Ready-job dispatch.
//!
//! When a job finishes, every successor is re-read from the store and
//! dispatched if all of its predecessors are finished. The decision runs
//! under a per-workflow lock so that predecessors finishing concurrently on
//! different workers dispatch a shared successor at most once.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn, Instrument};

use crate::config::{LockConfig, OrchestratorConfig};
use crate::error::{FlowError, Result};
use crate::events::{EventSink, WorkflowEventPayload};
use crate::executor::JobExecutor;
use crate::job::{JobId, JobRecord};
use crate::lock::{with_lock, LockProvider};
use crate::store::{Keyspace, WorkflowStore};
use crate::telemetry;
use crate::workflow::WorkflowId;

/// Result of one ready-job evaluation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Jobs whose readiness was checked.
    pub evaluated: Vec<JobId>,
    /// Jobs marked enqueued and handed to the executor.
    pub dispatched: Vec<JobId>,
}

/// Hands jobs to the executor and advances workflows on completion.
#[derive(Clone)]
pub struct ReadyJobDispatcher {
    store: Arc<dyn WorkflowStore>,
    locks: Arc<dyn LockProvider>,
    executor: Arc<dyn JobExecutor>,
    events: EventSink,
    keys: Keyspace,
    lock_config: LockConfig,
}

impl std::fmt::Debug for ReadyJobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyJobDispatcher")
            .field("keys", &self.keys)
            .field("lock_config", &self.lock_config)
            .field("events", &self.events)
            .finish()
    }
}

impl ReadyJobDispatcher {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        locks: Arc<dyn LockProvider>,
        executor: Arc<dyn JobExecutor>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            locks,
            executor,
            events: EventSink::disabled(),
            keys: Keyspace::new(config.store.key_prefix.clone()),
            lock_config: config.lock.clone(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn lock_key(&self, workflow_id: WorkflowId) -> String {
        self.keys.lock(workflow_id)
    }

    /// Mark an initial job enqueued and hand it to the executor, under the
    /// workflow lock.
    ///
    /// Returns `None` without submitting when the job is already enqueued,
    /// for example because a reconciliation sweep dispatched it first.
    pub async fn dispatch(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        let workflow_id = self.store.load_job(job_id).await?.workflow_id;
        self.locked(workflow_id, "dispatch", || async {
            let mut job = self.store.load_job(job_id).await?;
            if !job.enqueue() {
                debug!(job_id = %job_id, "job already enqueued, skipping dispatch");
                return Ok(None);
            }
            self.store.save_job(&job).await?;
            self.submit(&mut job, true).await?;
            Ok(Some(job))
        })
        .await
    }

    /// Clear a failed job and submit it again, under the workflow lock.
    ///
    /// Readiness is not re-evaluated. Returns `None`, submitting nothing,
    /// when the job is not failed.
    pub async fn resubmit(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        let workflow_id = self.store.load_job(job_id).await?.workflow_id;
        self.locked(workflow_id, "resubmit", || async {
            let mut job = self.store.load_job(job_id).await?;
            let failed_at = job.failed_at;
            if !job.clear_failure() {
                return Ok(None);
            }
            let newly_enqueued = job.enqueue();
            self.store.save_job(&job).await?;
            self.events
                .emit(
                    workflow_id,
                    WorkflowEventPayload::Restarted {
                        job_id,
                        job_type: job.job_type.clone(),
                    },
                )
                .await;
            if let Err(err) = self.submit(&mut job, newly_enqueued).await {
                job.failed_at = failed_at;
                self.store.save_job(&job).await?;
                return Err(err);
            }
            Ok(Some(job))
        })
        .await
    }

    /// Run `f` under the workflow lock inside a `flowline.ready` span.
    async fn locked<T, F, Fut>(&self, workflow_id: WorkflowId, trigger: impl AsRef<str>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let key = self.lock_key(workflow_id);
        let span = telemetry::ready_evaluation_span(workflow_id.to_string(), trigger);
        let result = with_lock(self.locks.as_ref(), &key, &self.lock_config, f)
            .instrument(span)
            .await;
        if let Err(FlowError::LockTimeout { key, waited }) = &result {
            telemetry::record_lock_timeout(key, *waited);
        }
        result
    }

    /// Evaluate the successors of `finished` under the workflow lock.
    ///
    /// Fails with [`FlowError::LockTimeout`] when the lock is held for the
    /// whole retry budget; successors are then left untouched.
    pub async fn dispatch_ready(&self, finished: &JobRecord) -> Result<DispatchReport> {
        if finished.before.is_empty() {
            return Ok(DispatchReport::default());
        }
        let candidates: Vec<JobId> = finished.before.iter().copied().collect();
        let result = self
            .locked(finished.workflow_id, finished.id.to_string(), || {
                self.evaluate(finished.workflow_id, candidates)
            })
            .await;

        if let Err(FlowError::LockTimeout { .. }) = &result {
            self.events
                .emit(
                    finished.workflow_id,
                    WorkflowEventPayload::DispatchAbandoned { job_id: finished.id },
                )
                .await;
        }
        result
    }

    /// Dispatch every job of the workflow that is ready but not enqueued.
    ///
    /// Recovers successors left behind by an abandoned evaluation. Safe to
    /// run at any time; jobs already enqueued are never dispatched again.
    pub async fn reconcile(&self, workflow_id: WorkflowId) -> Result<DispatchReport> {
        self.locked(workflow_id, "reconcile", || async {
            let workflow = self.store.load_workflow(workflow_id).await?;
            let timer = telemetry::start_evaluation(workflow_id.to_string());
            let mut report = DispatchReport::default();

            for job in workflow.jobs.values() {
                if job.is_enqueued() {
                    continue;
                }
                report.evaluated.push(job.id);
                if job.enqueueable_with(|id| workflow.jobs.get(id)) {
                    let mut job = job.clone();
                    job.enqueue();
                    self.store.save_job(&job).await?;
                    self.submit(&mut job, true).await?;
                    report.dispatched.push(job.id);
                }
            }

            telemetry::observe_evaluation(timer, report.evaluated.len(), report.dispatched.len());
            if !report.dispatched.is_empty() {
                warn!(
                    workflow_id = %workflow_id,
                    dispatched = report.dispatched.len(),
                    "reconciliation dispatched stranded jobs"
                );
            }
            Ok(report)
        })
        .await
    }

    async fn evaluate(&self, workflow_id: WorkflowId, candidates: Vec<JobId>) -> Result<DispatchReport> {
        let timer = telemetry::start_evaluation(workflow_id.to_string());
        let mut report = DispatchReport::default();

        for id in candidates {
            let mut job = self.store.load_job(id).await?;
            report.evaluated.push(id);
            if !job.enqueueable(self.store.as_ref()).await? {
                debug!(job_id = %id, status = %job.status(), "successor not ready");
                continue;
            }
            job.enqueue();
            self.store.save_job(&job).await?;
            self.submit(&mut job, true).await?;
            report.dispatched.push(id);
        }

        telemetry::observe_evaluation(timer, report.evaluated.len(), report.dispatched.len());
        Ok(report)
    }

    /// Hand a persisted, enqueued job to the executor. When the executor
    /// refuses it and this call set `enqueued_at`, the marker is rolled back
    /// so the job stays eligible.
    async fn submit(&self, job: &mut JobRecord, newly_enqueued: bool) -> Result<()> {
        if let Err(source) = self.executor.submit(job).await {
            if newly_enqueued {
                job.enqueued_at = None;
                self.store.save_job(job).await?;
            }
            return Err(FlowError::Executor {
                job_id: job.id,
                source,
            });
        }

        telemetry::record_job_dispatched(job.id.to_string(), &job.job_type);
        self.events
            .emit(
                job.workflow_id,
                WorkflowEventPayload::Enqueued {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                },
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockProvider;
    use crate::store::InMemoryStore;
    use crate::workflow::{Dependencies, WorkflowBuilder};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Submissions {
        jobs: Mutex<Vec<JobId>>,
        refuse: Mutex<bool>,
    }

    #[async_trait]
    impl JobExecutor for Submissions {
        async fn submit(&self, job: &JobRecord) -> anyhow::Result<()> {
            if *self.refuse.lock() {
                anyhow::bail!("queue full");
            }
            self.jobs.lock().push(job.id);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        locks: Arc<InMemoryLockProvider>,
        executor: Arc<Submissions>,
        dispatcher: ReadyJobDispatcher,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::default());
        let locks = Arc::new(InMemoryLockProvider::new());
        let executor = Arc::new(Submissions::default());
        let config = OrchestratorConfig::default().with_lock(
            LockConfig::default()
                .with_ttl(Duration::from_secs(1))
                .with_retries(1, Duration::from_millis(5)),
        );
        let dispatcher = ReadyJobDispatcher::new(store.clone(), locks.clone(), executor.clone(), &config);
        Fixture {
            store,
            locks,
            executor,
            dispatcher,
        }
    }

    async fn finish(store: &InMemoryStore, id: JobId) -> JobRecord {
        let mut job = store.load_job(id).await.unwrap();
        job.enqueue();
        job.mark_started();
        job.mark_finished();
        store.save_job(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_join_waits_for_every_predecessor() {
        let fx = fixture();
        let mut builder = WorkflowBuilder::new("join");
        let a = builder.register_job("a", vec![], Dependencies::none());
        let b = builder.register_job("b", vec![], Dependencies::none());
        let c = builder.register_job("c", vec![], Dependencies::none().after([a, b]));
        let workflow = builder.finalize(true).unwrap();
        fx.store.save_workflow(&workflow).await.unwrap();

        let a_done = finish(&fx.store, a).await;
        let report = fx.dispatcher.dispatch_ready(&a_done).await.unwrap();
        assert_eq!(report.evaluated, vec![c]);
        assert!(report.dispatched.is_empty());

        let b_done = finish(&fx.store, b).await;
        let report = fx.dispatcher.dispatch_ready(&b_done).await.unwrap();
        assert_eq!(report.dispatched, vec![c]);
        assert!(fx.store.load_job(c).await.unwrap().is_enqueued());

        // A late duplicate notification does not dispatch again.
        let report = fx.dispatcher.dispatch_ready(&a_done).await.unwrap();
        assert!(report.dispatched.is_empty());
        assert_eq!(*fx.executor.jobs.lock(), vec![c]);
    }

    #[tokio::test]
    async fn test_held_lock_abandons_evaluation() {
        let fx = fixture();
        let mut builder = WorkflowBuilder::new("chain");
        let a = builder.register_job("a", vec![], Dependencies::none());
        let b = builder.register_job("b", vec![], Dependencies::none().after([a]));
        let workflow = builder.finalize(true).unwrap();
        fx.store.save_workflow(&workflow).await.unwrap();

        let _holder = fx
            .locks
            .try_acquire(&fx.dispatcher.lock_key(workflow.id), Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        let a_done = finish(&fx.store, a).await;
        let err = fx.dispatcher.dispatch_ready(&a_done).await.unwrap_err();
        assert!(matches!(err, FlowError::LockTimeout { .. }));
        assert!(!fx.store.load_job(b).await.unwrap().is_enqueued());
        assert!(fx.executor.jobs.lock().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_recovers_stranded_successor() {
        let fx = fixture();
        let mut builder = WorkflowBuilder::new("chain");
        let a = builder.register_job("a", vec![], Dependencies::none());
        let b = builder.register_job("b", vec![], Dependencies::none().after([a]));
        let workflow = builder.finalize(true).unwrap();
        fx.store.save_workflow(&workflow).await.unwrap();
        finish(&fx.store, a).await;

        let report = fx.dispatcher.reconcile(workflow.id).await.unwrap();
        assert_eq!(report.dispatched, vec![b]);

        let again = fx.dispatcher.reconcile(workflow.id).await.unwrap();
        assert!(again.dispatched.is_empty());
        assert_eq!(*fx.executor.jobs.lock(), vec![b]);
    }

    #[tokio::test]
    async fn test_refused_submission_rolls_back_enqueue() {
        let fx = fixture();
        let mut builder = WorkflowBuilder::new("single");
        let a = builder.register_job("a", vec![], Dependencies::none());
        let workflow = builder.finalize(true).unwrap();
        fx.store.save_workflow(&workflow).await.unwrap();
        *fx.executor.refuse.lock() = true;

        let err = fx.dispatcher.dispatch(a).await.unwrap_err();
        assert!(matches!(err, FlowError::Executor { job_id, .. } if job_id == a));
        assert!(!fx.store.load_job(a).await.unwrap().is_enqueued());
    }

    #[tokio::test]
    async fn test_initial_dispatch_after_reconcile_submits_once() {
        let fx = fixture();
        let mut builder = WorkflowBuilder::new("single");
        let a = builder.register_job("a", vec![], Dependencies::none());
        let workflow = builder.finalize(true).unwrap();
        fx.store.save_workflow(&workflow).await.unwrap();

        let report = fx.dispatcher.reconcile(workflow.id).await.unwrap();
        assert_eq!(report.dispatched, vec![a]);

        assert!(fx.dispatcher.dispatch(a).await.unwrap().is_none());
        assert_eq!(*fx.executor.jobs.lock(), vec![a]);
        assert!(!fx.locks.is_held(&fx.dispatcher.lock_key(workflow.id)));
    }

    #[tokio::test]
    async fn test_resubmit_only_failed_jobs() {
        let fx = fixture();
        let mut builder = WorkflowBuilder::new("single");
        let a = builder.register_job("a", vec![], Dependencies::none());
        let workflow = builder.finalize(true).unwrap();
        fx.store.save_workflow(&workflow).await.unwrap();
        fx.dispatcher.dispatch(a).await.unwrap();

        assert!(fx.dispatcher.resubmit(a).await.unwrap().is_none());

        let mut job = fx.store.load_job(a).await.unwrap();
        job.fail();
        fx.store.save_job(&job).await.unwrap();

        let restarted = fx.dispatcher.resubmit(a).await.unwrap().unwrap();
        assert!(restarted.failed_at.is_none());
        assert!(fx.dispatcher.resubmit(a).await.unwrap().is_none());
        assert_eq!(*fx.executor.jobs.lock(), vec![a, a]);
    }

    #[tokio::test]
    async fn test_refused_resubmit_keeps_job_failed() {
        let fx = fixture();
        let mut builder = WorkflowBuilder::new("single");
        let a = builder.register_job("a", vec![], Dependencies::none());
        let workflow = builder.finalize(true).unwrap();
        fx.store.save_workflow(&workflow).await.unwrap();
        fx.dispatcher.dispatch(a).await.unwrap();

        let mut job = fx.store.load_job(a).await.unwrap();
        job.fail();
        fx.store.save_job(&job).await.unwrap();
        *fx.executor.refuse.lock() = true;

        let err = fx.dispatcher.resubmit(a).await.unwrap_err();
        assert!(matches!(err, FlowError::Executor { job_id, .. } if job_id == a));
        assert!(fx.store.load_job(a).await.unwrap().is_failed());
    }

    #[tokio::test]
    async fn test_missing_successor_is_not_found() {
        let fx = fixture();
        let mut orphan = JobRecord::new(WorkflowId::new(), "a", vec![]);
        orphan.before.insert(JobId::new());
        orphan.mark_finished();

        let err = fx.dispatcher.dispatch_ready(&orphan).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
