//! Canned job handlers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use flowline::{HandlerError, JobContext, JobHandler, JobId, PayloadType, PayloadValue};
use parking_lot::Mutex;

/// Succeeds and logs which jobs it ran.
#[derive(Clone, Default)]
pub struct SucceedingHandler {
    runs: Arc<Mutex<Vec<JobId>>>,
}

impl SucceedingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Job ids in the order they ran.
    pub fn runs(&self) -> Vec<JobId> {
        self.runs.lock().clone()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().len()
    }
}

#[async_trait]
impl JobHandler for SucceedingHandler {
    async fn perform(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        self.runs.lock().push(ctx.job_id());
        Ok(())
    }
}

/// Fails a set number of times, then succeeds.
#[derive(Clone)]
pub struct FailingHandler {
    failures_left: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
    message: String,
}

impl FailingHandler {
    /// Fail on every attempt.
    pub fn always(message: impl Into<String>) -> Self {
        Self::times(usize::MAX, message)
    }

    /// Fail the first `count` attempts.
    pub fn times(count: usize, message: impl Into<String>) -> Self {
        Self {
            failures_left: Arc::new(AtomicUsize::new(count)),
            attempts: Arc::new(AtomicUsize::new(0)),
            message: message.into(),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn perform(&self, _ctx: &JobContext) -> Result<(), HandlerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow::anyhow!(self.message.clone()).into());
        }
        Ok(())
    }
}

/// Aborts every job it runs with a fixed reason.
#[derive(Clone, Debug)]
pub struct AbortingHandler {
    reason: String,
}

impl AbortingHandler {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl JobHandler for AbortingHandler {
    async fn perform(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        Err(ctx.abort(self.reason.clone()))
    }
}

/// Writes a payload under the job's type name, optionally copying the
/// values of `reads` into the log first.
#[derive(Clone)]
pub struct PayloadWriterHandler {
    value: PayloadValue,
    reads: Vec<(String, PayloadType)>,
    seen: Arc<Mutex<Vec<(String, Option<PayloadValue>)>>>,
}

impl PayloadWriterHandler {
    pub fn new(value: impl Into<PayloadValue>) -> Self {
        Self {
            value: value.into(),
            reads: Vec::new(),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Read payload `name` as `kind` before writing.
    pub fn reading(mut self, name: impl Into<String>, kind: PayloadType) -> Self {
        self.reads.push((name.into(), kind));
        self
    }

    /// Payloads observed by the handler, in read order.
    pub fn seen(&self) -> Vec<(String, Option<PayloadValue>)> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl JobHandler for PayloadWriterHandler {
    async fn perform(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        for (name, kind) in &self.reads {
            let value = ctx.payload(name, *kind).await?;
            self.seen.lock().push((name.clone(), value));
        }
        ctx.set_payload(self.value.clone()).await?;
        Ok(())
    }
}
