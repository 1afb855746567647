use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use flowline::{FlowError, JobExecutor, JobId, JobOutcome, JobRecord, LifecycleAdapter};
use parking_lot::Mutex;

/// A job handed to the executor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub job_id: JobId,
    pub job_type: String,
}

/// What happened when a queued submission was run.
#[derive(Debug)]
pub enum RunResult {
    /// The adapter returned normally.
    Completed(JobOutcome),
    /// The handler failed and the job went back on the queue.
    Retrying { attempt: u32, message: String },
    /// The handler failed with no retries left; the job is now failed.
    Exhausted { attempts: u32 },
    /// The adapter failed for a reason other than the handler.
    Failed(FlowError),
}

/// In-memory [`JobExecutor`] that queues submissions for the test to run.
///
/// Every accepted submission is logged and queued. [`RecordingExecutor::run_next`]
/// pops one and drives it through a [`LifecycleAdapter`], re-queueing
/// failures until `max_retries` is spent.
#[derive(Clone)]
pub struct RecordingExecutor {
    submitted: Arc<Mutex<Vec<Submission>>>,
    queue: Arc<Mutex<VecDeque<JobId>>>,
    attempts: Arc<Mutex<HashMap<JobId, u32>>>,
    refuse_remaining: Arc<AtomicUsize>,
    max_retries: u32,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::with_max_retries(0)
    }

    /// Re-run a failing job up to `max_retries` more times before giving up.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            submitted: Arc::new(Mutex::new(Vec::new())),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            attempts: Arc::new(Mutex::new(HashMap::new())),
            refuse_remaining: Arc::new(AtomicUsize::new(0)),
            max_retries,
        }
    }

    /// Every accepted submission, in order.
    pub fn submitted(&self) -> Vec<Submission> {
        self.submitted.lock().clone()
    }

    pub fn submitted_ids(&self) -> Vec<JobId> {
        self.submitted.lock().iter().map(|s| s.job_id).collect()
    }

    /// Number of times `job_id` was submitted.
    pub fn submission_count(&self, job_id: JobId) -> usize {
        self.submitted.lock().iter().filter(|s| s.job_id == job_id).count()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn assert_dispatch_count_eq(&self, expected: usize) {
        let actual = self.submitted.lock().len();
        assert_eq!(actual, expected, "Expected {} dispatches, got {}", expected, actual);
    }

    pub fn assert_dispatched_once(&self, job_id: JobId) {
        let count = self.submission_count(job_id);
        assert_eq!(count, 1, "Expected job {} to be dispatched once, got {}", job_id, count);
    }

    /// Refuse the next `count` submissions.
    pub fn refuse_next(&self, count: usize) {
        self.refuse_remaining.store(count, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.submitted.lock().clear();
        self.queue.lock().clear();
        self.attempts.lock().clear();
    }

    /// Run the oldest queued submission, if any.
    pub async fn run_next(&self, adapter: &LifecycleAdapter) -> Option<(JobId, RunResult)> {
        let job_id = self.queue.lock().pop_front()?;
        let result = match adapter.perform(job_id).await {
            Ok(outcome) => RunResult::Completed(outcome),
            Err(FlowError::Execution { message, .. }) => {
                let attempt = {
                    let mut attempts = self.attempts.lock();
                    let count = attempts.entry(job_id).or_insert(0);
                    *count += 1;
                    *count
                };
                if attempt <= self.max_retries {
                    self.queue.lock().push_back(job_id);
                    RunResult::Retrying { attempt, message }
                } else {
                    match adapter.on_retries_exhausted(job_id).await {
                        Ok(_) => RunResult::Exhausted { attempts: attempt },
                        Err(err) => RunResult::Failed(err),
                    }
                }
            }
            Err(err) => RunResult::Failed(err),
        };
        Some((job_id, result))
    }

    /// Run queued submissions until the queue is empty. New submissions
    /// made by successful jobs are run too.
    pub async fn drain(&self, adapter: &LifecycleAdapter) -> Vec<(JobId, RunResult)> {
        let mut results = Vec::new();
        while let Some(run) = self.run_next(adapter).await {
            results.push(run);
        }
        results
    }
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RecordingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingExecutor")
            .field("submitted", &self.submitted.lock().len())
            .field("pending", &self.queue.lock().len())
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[async_trait]
impl JobExecutor for RecordingExecutor {
    async fn submit(&self, job: &JobRecord) -> anyhow::Result<()> {
        let refused = self
            .refuse_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            anyhow::bail!("executor refused job {}", job.id);
        }

        tracing::debug!(job_id = %job.id, job_type = %job.job_type, "job submitted");
        self.submitted.lock().push(Submission {
            job_id: job.id,
            job_type: job.job_type.clone(),
        });
        self.queue.lock().push_back(job.id);
        Ok(())
    }
}
