use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::str::FromStr;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::job::{JobId, JobRecord, JobStatus};
use crate::store::WorkflowStore;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Aggregate status over every job of a workflow.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Started,
    Error,
    Finished,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Started => "started",
            WorkflowStatus::Error => "error",
            WorkflowStatus::Finished => "finished",
            WorkflowStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Finished | WorkflowStatus::Failed)
    }

    /// Aggregate job records: any failed, then all finished, then any
    /// error, then any started.
    pub fn aggregate<'a>(jobs: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut all_finished = true;
        let mut any_error = false;
        let mut any_started = false;

        for job in jobs {
            let status = job.status();
            if status == JobStatus::Failed {
                return WorkflowStatus::Failed;
            }
            all_finished &= status == JobStatus::Finished;
            any_error |= status == JobStatus::Error;
            any_started |= job.is_started();
        }

        if all_finished {
            WorkflowStatus::Finished
        } else if any_error {
            WorkflowStatus::Error
        } else if any_started {
            WorkflowStatus::Started
        } else {
            WorkflowStatus::Pending
        }
    }
}

impl Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted workflow instance and the job records it owns.
#[derive(Clone, Debug, PartialEq)]
pub struct Workflow {
    pub id: WorkflowId,
    pub workflow_type: String,
    pub jobs: BTreeMap<JobId, JobRecord>,
}

impl Workflow {
    pub fn status(&self) -> WorkflowStatus {
        WorkflowStatus::aggregate(self.jobs.values())
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.keys().copied().collect()
    }

    pub fn job(&self, id: &JobId) -> Option<&JobRecord> {
        self.jobs.get(id)
    }

    /// Jobs of the given type, in id order.
    pub fn jobs_of_type<'a>(&'a self, job_type: &'a str) -> impl Iterator<Item = &'a JobRecord> + 'a {
        self.jobs.values().filter(move |job| job.job_type == job_type)
    }

    pub fn initial_jobs(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values().filter(|job| job.is_initial())
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values().filter(|job| job.is_failed())
    }

    /// Re-read every job record from `store`.
    pub async fn reload(&mut self, store: &dyn WorkflowStore) -> Result<()> {
        let ids = self.job_ids();
        let fresh = store.load_jobs(&ids).await?;
        self.jobs = fresh.into_iter().collect();
        Ok(())
    }
}

/// Ordering constraints declared when registering a job.
///
/// `before` lists jobs that must wait for the new job; `after` lists jobs
/// the new job waits for.
#[derive(Clone, Debug, Default)]
pub struct Dependencies {
    before: Vec<JobId>,
    after: Vec<JobId>,
}

impl Dependencies {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn before(mut self, ids: impl IntoIterator<Item = JobId>) -> Self {
        self.before.extend(ids);
        self
    }

    pub fn after(mut self, ids: impl IntoIterator<Item = JobId>) -> Self {
        self.after.extend(ids);
        self
    }
}

/// Collects jobs and ordering constraints for a new workflow.
///
/// Edges are kept pending until [`WorkflowBuilder::finalize`] resolves them
/// into the `before`/`after` sets of both endpoints.
#[derive(Debug)]
pub struct WorkflowBuilder {
    id: WorkflowId,
    workflow_type: String,
    jobs: BTreeMap<JobId, JobRecord>,
    pending_edges: Vec<(JobId, JobId)>,
}

impl WorkflowBuilder {
    pub fn new(workflow_type: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(),
            workflow_type: workflow_type.into(),
            jobs: BTreeMap::new(),
            pending_edges: Vec::new(),
        }
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn register_job(
        &mut self,
        job_type: impl Into<String>,
        args: Vec<Value>,
        dependencies: Dependencies,
    ) -> JobId {
        let job = JobRecord::new(self.id, job_type, args);
        let id = job.id;
        for successor in dependencies.before {
            self.pending_edges.push((id, successor));
        }
        for predecessor in dependencies.after {
            self.pending_edges.push((predecessor, id));
        }
        self.jobs.insert(id, job);
        id
    }

    /// Declare that `from` must finish before `to` starts.
    pub fn add_edge(&mut self, from: JobId, to: JobId) -> &mut Self {
        self.pending_edges.push((from, to));
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Resolve pending edges into job records.
    ///
    /// Fails with [`FlowError::InvalidEdge`] when an edge names an unknown
    /// job, and with [`FlowError::CycleDetected`] when `validate_acyclic`
    /// is set and the graph has a cycle.
    pub fn finalize(mut self, validate_acyclic: bool) -> Result<Workflow> {
        let mut seen = HashSet::new();
        for (from, to) in std::mem::take(&mut self.pending_edges) {
            if !self.jobs.contains_key(&from) || !self.jobs.contains_key(&to) {
                return Err(FlowError::InvalidEdge { from, to });
            }
            if !seen.insert((from, to)) {
                continue;
            }
            if let Some(job) = self.jobs.get_mut(&from) {
                job.before.insert(to);
            }
            if let Some(job) = self.jobs.get_mut(&to) {
                job.after.insert(from);
            }
        }

        if validate_acyclic {
            check_acyclic(&self.jobs)?;
        }

        Ok(Workflow {
            id: self.id,
            workflow_type: self.workflow_type,
            jobs: self.jobs,
        })
    }
}

fn check_acyclic(jobs: &BTreeMap<JobId, JobRecord>) -> Result<()> {
    // Edge direction: predecessor -> successor.
    let mut graph: DiGraphMap<JobId, ()> = DiGraphMap::new();
    for id in jobs.keys() {
        graph.add_node(*id);
    }
    for job in jobs.values() {
        for successor in &job.before {
            graph.add_edge(job.id, *successor, ());
        }
    }

    match toposort(&graph, None) {
        Ok(_) => Ok(()),
        Err(cycle) => Err(FlowError::CycleDetected {
            job_id: cycle.node_id(),
        }),
    }
}

/// A reusable workflow template.
///
/// `configure` registers the jobs and edges of one instance; the
/// orchestrator finalizes, persists and starts it.
pub trait WorkflowDefinition: Send + Sync {
    fn workflow_type(&self) -> &str;

    fn configure(&self, builder: &mut WorkflowBuilder) -> Result<()>;
}
