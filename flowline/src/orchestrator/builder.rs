use std::fmt;
use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::dispatch::ReadyJobDispatcher;
use crate::error::{FlowError, Result};
use crate::events::{EventPublisher, EventSink, WorkflowEvent};
use crate::executor::JobExecutor;
use crate::lock::LockProvider;
use crate::store::WorkflowStore;

use super::Orchestrator;

/// Builder for constructing an [`Orchestrator`] with explicit dependencies.
///
/// Store, lock provider and executor are required; the event publisher is
/// optional.
///
/// # Example
///
/// ```ignore
/// let orchestrator = Orchestrator::builder(config)
///     .with_store(Arc::new(InMemoryStore::default()))
///     .with_locks(Arc::new(InMemoryLockProvider::new()))
///     .with_executor(executor)
///     .build()?;
/// ```
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    store: Option<Arc<dyn WorkflowStore>>,
    locks: Option<Arc<dyn LockProvider>>,
    executor: Option<Arc<dyn JobExecutor>>,
    events: Option<Arc<dyn EventPublisher<WorkflowEvent>>>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("store_set", &self.store.is_some())
            .field("locks_set", &self.locks.is_some())
            .field("executor_set", &self.executor.is_some())
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            locks: None,
            executor: None,
            events: None,
        }
    }

    /// Set the persistence store.
    pub fn with_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the lock provider guarding ready-job evaluation.
    pub fn with_locks(mut self, locks: Arc<dyn LockProvider>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Set the executor jobs are handed to.
    pub fn with_executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the lifecycle event publisher.
    pub fn with_events(mut self, events: Arc<dyn EventPublisher<WorkflowEvent>>) -> Self {
        self.events = Some(events);
        self
    }

    /// # Errors
    ///
    /// Returns [`FlowError::Configuration`] if a required dependency is
    /// missing or the lock TTL is zero.
    pub fn build(self) -> Result<Orchestrator> {
        let store = self
            .store
            .ok_or_else(|| FlowError::Configuration("store dependency missing".into()))?;
        let locks = self
            .locks
            .ok_or_else(|| FlowError::Configuration("lock provider dependency missing".into()))?;
        let executor = self
            .executor
            .ok_or_else(|| FlowError::Configuration("executor dependency missing".into()))?;
        if self.config.lock.ttl_ms == 0 {
            return Err(FlowError::Configuration("lock ttl must be positive".into()));
        }

        let events = self.events.map(EventSink::new).unwrap_or_default();
        let dispatcher = ReadyJobDispatcher::new(store, locks, executor, &self.config).with_events(events);
        Ok(Orchestrator::from_parts(self.config, dispatcher))
    }
}
