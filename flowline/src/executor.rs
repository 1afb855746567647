use async_trait::async_trait;

use crate::job::JobRecord;

/// The external queue/worker pool that actually runs jobs.
///
/// Flowline never executes job bodies itself. It hands each dispatched job
/// to the executor, which later calls back into a
/// [`LifecycleAdapter`](crate::adapter::LifecycleAdapter) to run it and owns
/// any retry policy.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Queue `job` for execution. The record is already marked enqueued and
    /// persisted when this is called; the executor needs only
    /// `job.id`, `job.job_type` and `job.args`.
    async fn submit(&self, job: &JobRecord) -> anyhow::Result<()>;
}
