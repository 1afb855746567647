use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::job::JobId;
use crate::workflow::WorkflowId;

/// Metadata envelope attached to every workflow event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub event_id: Uuid,
    pub workflow_id: WorkflowId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(workflow_id: WorkflowId) -> Self {
        Self {
            version: 1,
            event_id: Uuid::now_v7(),
            workflow_id,
            timestamp: Utc::now(),
        }
    }
}

/// A lifecycle transition observed by the orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub meta: EventMeta,
    pub payload: WorkflowEventPayload,
}

impl WorkflowEvent {
    pub fn new(workflow_id: WorkflowId, payload: WorkflowEventPayload) -> Self {
        Self {
            meta: EventMeta::new(workflow_id),
            payload,
        }
    }
}

/// Event payload emitted for job and workflow transitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum WorkflowEventPayload {
    /// Workflow persisted and its initial jobs dispatched.
    WorkflowStarted { workflow_type: String, jobs: usize },
    /// Job marked enqueued and handed to the executor.
    Enqueued { job_id: JobId, job_type: String },
    /// Job logic is about to run.
    Started { job_id: JobId, job_type: String },
    /// Job logic returned successfully.
    Finished { job_id: JobId, job_type: String },
    /// Job logic raised; the executor may retry.
    Errored {
        job_id: JobId,
        job_type: String,
        message: String,
    },
    /// Job reached terminal failure by abort or retry exhaustion.
    Failed {
        job_id: JobId,
        job_type: String,
        reason: String,
    },
    /// A failed job was cleared and re-dispatched.
    Restarted { job_id: JobId, job_type: String },
    /// Ready-job evaluation could not take the workflow lock.
    DispatchAbandoned { job_id: JobId },
}

/// Generic event publisher trait for publishing events of type `E`.
#[async_trait]
pub trait EventPublisher<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Publish an event to all subscribers.
    ///
    /// Returns an error if the event cannot be published.
    async fn publish(&self, event: E) -> anyhow::Result<()>;
}

/// Generic event subscriber trait for receiving events of type `E`.
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Subscribe to events, returning a broadcast receiver.
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// Optional publisher shared by the dispatcher, adapter and orchestrator.
///
/// Publishing failures are logged and never interrupt the caller.
#[derive(Clone, Default)]
pub struct EventSink {
    publisher: Option<Arc<dyn EventPublisher<WorkflowEvent>>>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("enabled", &self.publisher.is_some())
            .finish()
    }
}

impl EventSink {
    pub fn new(publisher: Arc<dyn EventPublisher<WorkflowEvent>>) -> Self {
        Self {
            publisher: Some(publisher),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub async fn emit(&self, workflow_id: WorkflowId, payload: WorkflowEventPayload) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        if let Err(err) = publisher.publish(WorkflowEvent::new(workflow_id, payload)).await {
            warn!(workflow_id = %workflow_id, error = %err, "failed to publish workflow event");
        }
    }
}

/// In-process fan-out bus for [`WorkflowEvent`]s.
///
/// Publishing never waits on subscribers. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged`. Events published
/// with no subscribers are dropped.
pub struct InProcEventBus {
    sender: broadcast::Sender<WorkflowEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventPublisher<WorkflowEvent> for InProcEventBus {
    async fn publish(&self, event: WorkflowEvent) -> anyhow::Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }
}

impl EventSubscriber<WorkflowEvent> for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }
}
