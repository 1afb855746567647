//! Benchmarks for workflow start and ready-job dispatch over the
//! in-memory store.

use std::sync::Arc;

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use flowline::{
    Dependencies, HandlerError, HandlerRegistry, InMemoryLockProvider, InMemoryStore, JobContext, JobExecutor,
    JobHandler, JobRecord, Orchestrator, OrchestratorConfig, WorkflowBuilder,
};

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

struct Discard;

#[async_trait]
impl JobExecutor for Discard {
    async fn submit(&self, _job: &JobRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Noop;

#[async_trait]
impl JobHandler for Noop {
    async fn perform(&self, _ctx: &JobContext) -> Result<(), HandlerError> {
        Ok(())
    }
}

fn orchestrator() -> Orchestrator {
    Orchestrator::builder(OrchestratorConfig::default())
        .with_store(Arc::new(InMemoryStore::default()))
        .with_locks(Arc::new(InMemoryLockProvider::new()))
        .with_executor(Arc::new(Discard))
        .build()
        .expect("orchestrator")
}

fn bench_start(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("start_chain");
    for len in [10usize, 100] {
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            let orchestrator = orchestrator();
            b.to_async(&rt).iter(|| {
                let orchestrator = orchestrator.clone();
                async move {
                    let mut builder = WorkflowBuilder::new("chain");
                    let mut previous = builder.register_job("Step", vec![], Dependencies::none());
                    for _ in 1..len {
                        previous = builder.register_job("Step", vec![], Dependencies::none().after([previous]));
                    }
                    orchestrator.start_builder(builder).await.unwrap();
                }
            });
        });
    }
    group.finish();
}

fn bench_fan_in(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("complete_fan_in");
    for width in [4usize, 32] {
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            let orchestrator = orchestrator();
            let adapter = orchestrator.adapter(Arc::new(HandlerRegistry::new().with("Step", Noop)));
            b.to_async(&rt).iter(|| {
                let orchestrator = orchestrator.clone();
                let adapter = adapter.clone();
                async move {
                    let mut builder = WorkflowBuilder::new("fan-in");
                    let branches: Vec<_> = (0..width)
                        .map(|_| builder.register_job("Step", vec![], Dependencies::none()))
                        .collect();
                    builder.register_job("Step", vec![], Dependencies::none().after(branches.clone()));
                    orchestrator.start_builder(builder).await.unwrap();
                    for id in branches {
                        adapter.perform(id).await.unwrap();
                    }
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_start, bench_fan_in);
criterion_main!(benches);
