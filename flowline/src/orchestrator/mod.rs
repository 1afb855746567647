//! Workflow-level operations.
//!
//! [`Orchestrator`] is the entry point callers hold: it starts workflows,
//! reads their status, restarts failed jobs and hands out
//! [`LifecycleAdapter`]s for executors.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn, Instrument};

use crate::adapter::LifecycleAdapter;
use crate::config::OrchestratorConfig;
use crate::dispatch::{DispatchReport, ReadyJobDispatcher};
use crate::error::{FlowError, Result};
use crate::events::WorkflowEventPayload;
use crate::job::{JobId, JobRecord};
use crate::registry::HandlerRegistry;
use crate::store::WorkflowStore;
use crate::telemetry;
use crate::workflow::{Workflow, WorkflowBuilder, WorkflowDefinition, WorkflowId, WorkflowStatus};

pub mod builder;

pub use builder::OrchestratorBuilder;

/// Settings for [`Orchestrator::wait`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitOptions {
    /// Delay between reloads.
    pub interval: Duration,
    /// Give up with [`FlowError::WaitTimeout`] after this long.
    pub timeout: Option<Duration>,
    /// Return as soon as the workflow reports `error`.
    pub stop_on_error: bool,
}

impl WaitOptions {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
            stop_on_error: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }
}

/// Entry point for creating and managing workflows.
#[derive(Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn WorkflowStore>,
    dispatcher: ReadyJobDispatcher,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub(crate) fn from_parts(config: OrchestratorConfig, dispatcher: ReadyJobDispatcher) -> Self {
        Self {
            config,
            store: dispatcher.store().clone(),
            dispatcher,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &ReadyJobDispatcher {
        &self.dispatcher
    }

    /// Adapter an executor uses to run jobs of this orchestrator.
    pub fn adapter(&self, registry: Arc<HandlerRegistry>) -> LifecycleAdapter {
        LifecycleAdapter::new(self.dispatcher.clone(), registry)
    }

    /// Build, persist and start an instance of `definition`.
    pub async fn start(&self, definition: &dyn WorkflowDefinition) -> Result<Workflow> {
        let mut builder = WorkflowBuilder::new(definition.workflow_type());
        definition.configure(&mut builder)?;
        self.start_builder(builder).await
    }

    /// Finalize `builder`, persist the workflow and dispatch its initial
    /// jobs. Returns the workflow as stored after dispatch.
    pub async fn start_builder(&self, builder: WorkflowBuilder) -> Result<Workflow> {
        let span = telemetry::workflow_start_span(builder.id().to_string(), builder.workflow_type());
        self.persist_and_dispatch(builder).instrument(span).await
    }

    async fn persist_and_dispatch(&self, builder: WorkflowBuilder) -> Result<Workflow> {
        let mut workflow = builder.finalize(self.config.validate_acyclic)?;
        self.store.save_workflow(&workflow).await?;

        let initial: Vec<JobId> = workflow.initial_jobs().map(|job| job.id).collect();
        if initial.is_empty() && !workflow.jobs.is_empty() {
            warn!(workflow_id = %workflow.id, "workflow has no initial jobs and will not progress");
        }
        for id in &initial {
            self.dispatcher.dispatch(*id).await?;
        }
        workflow.reload(self.store.as_ref()).await?;

        info!(
            workflow_id = %workflow.id,
            workflow_type = %workflow.workflow_type,
            jobs = workflow.jobs.len(),
            initial = initial.len(),
            "workflow started"
        );
        self.dispatcher
            .events()
            .emit(
                workflow.id,
                WorkflowEventPayload::WorkflowStarted {
                    workflow_type: workflow.workflow_type.clone(),
                    jobs: workflow.jobs.len(),
                },
            )
            .await;
        Ok(workflow)
    }

    /// Load a workflow; fails if it does not exist.
    pub async fn find(&self, id: WorkflowId) -> Result<Workflow> {
        self.store.load_workflow(id).await
    }

    pub async fn find_job(&self, id: JobId) -> Result<JobRecord> {
        self.store.load_job(id).await
    }

    pub async fn status(&self, id: WorkflowId) -> Result<WorkflowStatus> {
        Ok(self.find(id).await?.status())
    }

    /// Clear a failed job and dispatch it again.
    ///
    /// Returns false, without dispatching, when the job is not failed. The
    /// clear and the re-submission run under the workflow lock, so
    /// concurrent restarts of the same job dispatch it once.
    pub async fn restart_job(&self, id: JobId) -> Result<bool> {
        match self.dispatcher.resubmit(id).await? {
            Some(job) => {
                info!(job_id = %id, workflow_id = %job.workflow_id, "restarted failed job");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Restart every failed job of the workflow. Returns the restarted ids.
    pub async fn continue_workflow(&self, id: WorkflowId) -> Result<Vec<JobId>> {
        let workflow = self.find(id).await?;
        let failed: Vec<JobId> = workflow.failed_jobs().map(|job| job.id).collect();
        let mut restarted = Vec::with_capacity(failed.len());
        for job_id in failed {
            if self.restart_job(job_id).await? {
                restarted.push(job_id);
            }
        }
        Ok(restarted)
    }

    /// Dispatch ready jobs left behind by abandoned evaluations.
    pub async fn reconcile(&self, id: WorkflowId) -> Result<DispatchReport> {
        self.dispatcher.reconcile(id).await
    }

    /// Reload the workflow every `options.interval` until it is finished
    /// or failed (or in error, with `stop_on_error`).
    pub async fn wait(&self, id: WorkflowId, options: WaitOptions) -> Result<Workflow> {
        match options.timeout {
            Some(limit) => tokio::time::timeout(limit, self.poll_until_settled(id, &options))
                .await
                .map_err(|_| FlowError::WaitTimeout {
                    workflow_id: id,
                    waited: limit,
                })?,
            None => self.poll_until_settled(id, &options).await,
        }
    }

    async fn poll_until_settled(&self, id: WorkflowId, options: &WaitOptions) -> Result<Workflow> {
        loop {
            let workflow = self.find(id).await?;
            let status = workflow.status();
            if status.is_terminal() || (options.stop_on_error && status == WorkflowStatus::Error) {
                return Ok(workflow);
            }
            tokio::time::sleep(options.interval).await;
        }
    }

    /// [`Orchestrator::wait`] with the configured poll interval.
    pub async fn wait_until_done(&self, id: WorkflowId) -> Result<Workflow> {
        self.wait(id, WaitOptions::new(self.config.poll_interval())).await
    }
}
