use std::sync::Arc;

use flowline::{
    HandlerRegistry, InMemoryLockProvider, InMemoryStore, InProcEventBus, JobId, LifecycleAdapter,
    Orchestrator, OrchestratorConfig, Result, Workflow, WorkflowBuilder,
};

use crate::executor::{RecordingExecutor, RunResult};

/// An orchestrator over in-memory parts, with handles to each part.
pub struct TestHarness {
    pub orchestrator: Orchestrator,
    pub adapter: LifecycleAdapter,
    pub store: Arc<InMemoryStore>,
    pub locks: Arc<InMemoryLockProvider>,
    pub executor: RecordingExecutor,
    pub events: Arc<InProcEventBus>,
}

impl TestHarness {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self::with_parts(OrchestratorConfig::default(), registry, RecordingExecutor::new())
    }

    pub fn with_parts(config: OrchestratorConfig, registry: HandlerRegistry, executor: RecordingExecutor) -> Self {
        let store = Arc::new(InMemoryStore::new(config.store.clone()));
        let locks = Arc::new(InMemoryLockProvider::new());
        let events = Arc::new(InProcEventBus::new(256));

        let orchestrator = Orchestrator::builder(config)
            .with_store(store.clone())
            .with_locks(locks.clone())
            .with_executor(Arc::new(executor.clone()))
            .with_events(events.clone())
            .build()
            .expect("in-memory orchestrator");
        let adapter = orchestrator.adapter(Arc::new(registry));

        Self {
            orchestrator,
            adapter,
            store,
            locks,
            executor,
            events,
        }
    }

    pub async fn start(&self, builder: WorkflowBuilder) -> Result<Workflow> {
        self.orchestrator.start_builder(builder).await
    }

    /// Run submissions until none are left.
    pub async fn drain(&self) -> Vec<(JobId, RunResult)> {
        self.executor.drain(&self.adapter).await
    }
}
