//! ETL pipeline over an in-process worker pool.
//!
//! Jobs are submitted to a tokio channel and run by a small set of worker
//! tasks through the lifecycle adapter. The workflow fans out one extract
//! job per source, joins them in a transform step and finishes with a load.
//!
//! Run with: `cargo run --example etl_pipeline`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowline::*;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

const MAX_ATTEMPTS: u32 = 3;

/// Executor that forwards job ids to worker tasks.
struct ChannelExecutor {
    sender: mpsc::UnboundedSender<JobId>,
}

#[async_trait]
impl JobExecutor for ChannelExecutor {
    async fn submit(&self, job: &JobRecord) -> anyhow::Result<()> {
        self.sender.send(job.id)?;
        Ok(())
    }
}

struct Extract;

#[async_trait]
impl JobHandler for Extract {
    async fn perform(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        let source: String = ctx.arg(0)?;
        let rows: i64 = ctx.arg(1)?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        println!("[EXTRACT] {source}: {rows} rows");
        ctx.set_named_payload(&format!("rows:{source}"), rows).await?;
        Ok(())
    }
}

struct Transform;

#[async_trait]
impl JobHandler for Transform {
    async fn perform(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        let sources: Vec<String> = ctx.arg(0)?;
        let mut total = 0;
        for source in &sources {
            let rows = ctx
                .payload(&format!("rows:{source}"), PayloadType::Integer)
                .await?
                .and_then(|value| value.as_i64())
                .unwrap_or_default();
            total += rows;
        }
        if total == 0 {
            return Err(ctx.abort("no rows extracted"));
        }
        println!("[TRANSFORM] {total} rows from {} sources", sources.len());
        ctx.set_payload(json!({ "total": total, "sources": sources })).await?;
        Ok(())
    }
}

struct Load;

#[async_trait]
impl JobHandler for Load {
    async fn perform(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        let summary = ctx.payload("Transform", PayloadType::Structured).await?;
        println!("[LOAD] writing {:?}", summary.as_ref().and_then(PayloadValue::as_json));
        Ok(())
    }
}

struct Etl {
    sources: Vec<(&'static str, i64)>,
}

impl WorkflowDefinition for Etl {
    fn workflow_type(&self) -> &str {
        "Etl"
    }

    fn configure(&self, builder: &mut WorkflowBuilder) -> flowline::Result<()> {
        let extracts: Vec<JobId> = self
            .sources
            .iter()
            .map(|(source, rows)| builder.register_job("Extract", vec![json!(source), json!(rows)], Dependencies::none()))
            .collect();
        let names: Vec<&str> = self.sources.iter().map(|(source, _)| *source).collect();
        let transform = builder.register_job("Transform", vec![json!(names)], Dependencies::none().after(extracts));
        builder.register_job("Load", vec![], Dependencies::none().after([transform]));
        Ok(())
    }
}

async fn run_worker(id: usize, adapter: LifecycleAdapter, receiver: Arc<Mutex<mpsc::UnboundedReceiver<JobId>>>) {
    loop {
        let Some(job_id) = receiver.lock().await.recv().await else {
            break;
        };
        let mut attempt = 1;
        loop {
            match adapter.perform(job_id).await.and_then(|outcome| outcome.into_report(job_id)) {
                Ok(report) => {
                    tracing::debug!(worker = id, job_id = %job_id, dispatched = report.dispatched.len(), "job done");
                    break;
                }
                Err(FlowError::Aborted { reason, .. }) => {
                    tracing::warn!(worker = id, job_id = %job_id, %reason, "job aborted");
                    break;
                }
                Err(FlowError::Execution { message, .. }) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(worker = id, job_id = %job_id, attempt, %message, "retrying job");
                    attempt += 1;
                }
                Err(FlowError::Execution { .. }) => {
                    if let Err(err) = adapter.on_retries_exhausted(job_id).await {
                        tracing::error!(job_id = %job_id, error = %err, "could not mark job failed");
                    }
                    break;
                }
                Err(err) => {
                    tracing::error!(worker = id, job_id = %job_id, error = %err, "job could not run");
                    break;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("info,flowline=debug");

    let (sender, receiver) = mpsc::unbounded_channel();
    let config = OrchestratorConfig::default().with_poll_interval(Duration::from_millis(50));
    let orchestrator = Orchestrator::builder(config)
        .with_store(Arc::new(InMemoryStore::default()))
        .with_locks(Arc::new(InMemoryLockProvider::new()))
        .with_executor(Arc::new(ChannelExecutor { sender }))
        .with_events(Arc::new(InProcEventBus::new(64)))
        .build()?;

    let registry = HandlerRegistry::new()
        .with("Extract", Extract)
        .with("Transform", Transform)
        .with("Load", Load);
    let adapter = orchestrator.adapter(Arc::new(registry));

    let receiver = Arc::new(Mutex::new(receiver));
    let workers: Vec<_> = (0..3)
        .map(|id| tokio::spawn(run_worker(id, adapter.clone(), receiver.clone())))
        .collect();

    let workflow = orchestrator
        .start(&Etl {
            sources: vec![("orders", 120), ("customers", 40), ("refunds", 7)],
        })
        .await?;
    println!("Started workflow {} with {} jobs", workflow.id, workflow.jobs.len());

    let done = orchestrator
        .wait(
            workflow.id,
            WaitOptions::new(Duration::from_millis(50)).with_timeout(Duration::from_secs(10)),
        )
        .await?;
    println!("Workflow {} is {}", done.id, done.status());
    for job in done.jobs.values() {
        println!("  {:<10} {:<10} {}", job.job_type, job.status().label(), job.id);
    }

    for worker in workers {
        worker.abort();
    }
    Ok(())
}
