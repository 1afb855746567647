//! Restart, continue, waiting and event publication.

use std::sync::Arc;
use std::time::Duration;

use flowline::{
    Dependencies, EventSubscriber, FlowError, HandlerRegistry, JobStatus, LockConfig, OrchestratorConfig,
    WaitOptions, WorkflowBuilder, WorkflowEventPayload, WorkflowStatus, WorkflowStore,
};
use flowline_testkit::{AbortingHandler, FailingHandler, RecordingExecutor, SucceedingHandler, TestHarness};
use futures::future::join_all;

#[tokio::test]
async fn test_restart_redispatches_failed_job_once() {
    let mut registry = HandlerRegistry::new();
    registry
        .register("Step", FailingHandler::times(1, "flaky"))
        .register("Next", SucceedingHandler::new());
    let harness = TestHarness::new(registry);

    let mut builder = WorkflowBuilder::new("restart");
    let step = builder.register_job("Step", vec![], Dependencies::none());
    let next = builder.register_job("Next", vec![], Dependencies::none().after([step]));
    let workflow = harness.start(builder).await.unwrap();

    harness.drain().await;
    assert_eq!(
        harness.orchestrator.status(workflow.id).await.unwrap(),
        WorkflowStatus::Failed
    );

    assert!(harness.orchestrator.restart_job(step).await.unwrap());
    assert!(!harness.orchestrator.restart_job(step).await.unwrap());
    assert_eq!(harness.executor.submission_count(step), 2);

    let job = harness.store.load_job(step).await.unwrap();
    assert!(job.failed_at.is_none());
    assert_eq!(job.status(), JobStatus::Error);

    harness.drain().await;
    harness.executor.assert_dispatched_once(next);
    assert_eq!(
        harness.orchestrator.status(workflow.id).await.unwrap(),
        WorkflowStatus::Finished
    );
}

#[tokio::test]
async fn test_restart_of_unknown_job_is_not_found() {
    let harness = TestHarness::new(HandlerRegistry::new());
    let err = harness.orchestrator.restart_job(flowline::JobId::new()).await.unwrap_err();
    assert!(matches!(err, FlowError::JobNotFound(_)));
}

#[tokio::test]
async fn test_continue_restarts_every_failed_job() {
    let mut registry = HandlerRegistry::new();
    registry
        .register("Part", AbortingHandler::new("quota"))
        .register("Done", SucceedingHandler::new());
    let harness = TestHarness::new(registry);

    let mut builder = WorkflowBuilder::new("continue");
    let a = builder.register_job("Part", vec![], Dependencies::none());
    let b = builder.register_job("Part", vec![], Dependencies::none());
    builder.register_job("Done", vec![], Dependencies::none().after([a, b]));
    let workflow = harness.start(builder).await.unwrap();
    harness.drain().await;

    let mut restarted = harness.orchestrator.continue_workflow(workflow.id).await.unwrap();
    restarted.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(restarted, expected);

    let workflow = harness.orchestrator.find(workflow.id).await.unwrap();
    assert!(workflow.failed_jobs().next().is_none());
    assert_eq!(workflow.status(), WorkflowStatus::Error);
    assert!(harness
        .orchestrator
        .continue_workflow(workflow.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_continue_restarts_each_job_once() {
    let config = OrchestratorConfig::default()
        .with_lock(LockConfig::default().with_retries(500, Duration::from_millis(1)));
    for _ in 0..10 {
        let harness = TestHarness::with_parts(
            config.clone(),
            HandlerRegistry::new().with("Part", AbortingHandler::new("quota")),
            RecordingExecutor::new(),
        );
        let mut builder = WorkflowBuilder::new("continue-race");
        let a = builder.register_job("Part", vec![], Dependencies::none());
        let b = builder.register_job("Part", vec![], Dependencies::none());
        let workflow = harness.start(builder).await.unwrap();
        harness.drain().await;

        let tasks = (0..4).map(|_| {
            let orchestrator = harness.orchestrator.clone();
            tokio::spawn(async move { orchestrator.continue_workflow(workflow.id).await })
        });
        let restarted: usize = join_all(tasks)
            .await
            .into_iter()
            .map(|result| result.unwrap().unwrap().len())
            .sum();

        assert_eq!(restarted, 2);
        assert_eq!(harness.executor.submission_count(a), 2);
        assert_eq!(harness.executor.submission_count(b), 2);
    }
}

#[tokio::test]
async fn test_wait_returns_once_finished() {
    let mut registry = HandlerRegistry::new();
    registry.register("Step", SucceedingHandler::new());
    let harness = Arc::new(TestHarness::new(registry));

    let mut builder = WorkflowBuilder::new("wait");
    builder.register_job("Step", vec![], Dependencies::none());
    let workflow = harness.start(builder).await.unwrap();

    let runner = harness.clone();
    let drain = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        runner.drain().await.len()
    });

    let done = harness
        .orchestrator
        .wait(
            workflow.id,
            WaitOptions::new(Duration::from_millis(5)).with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(done.status(), WorkflowStatus::Finished);
    assert_eq!(drain.await.unwrap(), 1);
}

#[tokio::test]
async fn test_wait_times_out_on_stalled_workflow() {
    let mut registry = HandlerRegistry::new();
    registry.register("Step", SucceedingHandler::new());
    let harness = TestHarness::new(registry);

    let mut builder = WorkflowBuilder::new("stalled");
    builder.register_job("Step", vec![], Dependencies::none());
    let workflow = harness.start(builder).await.unwrap();

    let err = harness
        .orchestrator
        .wait(
            workflow.id,
            WaitOptions::new(Duration::from_millis(5)).with_timeout(Duration::from_millis(40)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::WaitTimeout { .. }));
}

#[tokio::test]
async fn test_wait_can_stop_on_error() {
    let mut registry = HandlerRegistry::new();
    registry.register("Step", FailingHandler::always("boom"));
    let harness = TestHarness::with_parts(
        OrchestratorConfig::default(),
        registry,
        RecordingExecutor::with_max_retries(5),
    );

    let mut builder = WorkflowBuilder::new("errors");
    builder.register_job("Step", vec![], Dependencies::none());
    let workflow = harness.start(builder).await.unwrap();
    harness.executor.run_next(&harness.adapter).await.unwrap();

    let current = harness
        .orchestrator
        .wait(
            workflow.id,
            WaitOptions::new(Duration::from_millis(5))
                .with_timeout(Duration::from_secs(1))
                .stop_on_error(true),
        )
        .await
        .unwrap();
    assert_eq!(current.status(), WorkflowStatus::Error);
}

#[tokio::test]
async fn test_refused_initial_submission_leaves_job_pending() {
    let mut registry = HandlerRegistry::new();
    registry.register("Step", SucceedingHandler::new());
    let harness = TestHarness::new(registry);
    harness.executor.refuse_next(1);

    let mut builder = WorkflowBuilder::new("refused");
    let step = builder.register_job("Step", vec![], Dependencies::none());
    let id = builder.id();
    let err = harness.start(builder).await.unwrap_err();
    assert!(matches!(err, FlowError::Executor { job_id, .. } if job_id == step));

    let job = harness.store.load_job(step).await.unwrap();
    assert!(job.enqueued_at.is_none());

    let report = harness.orchestrator.reconcile(id).await.unwrap();
    assert_eq!(report.dispatched, vec![step]);
    harness.executor.assert_dispatched_once(step);
}

#[tokio::test]
async fn test_store_outage_is_propagated() {
    let harness = TestHarness::new(HandlerRegistry::new().with("Step", SucceedingHandler::new()));
    let mut builder = WorkflowBuilder::new("outage");
    builder.register_job("Step", vec![], Dependencies::none());
    let workflow = harness.start(builder).await.unwrap();

    harness.store.set_unavailable(true);
    let err = harness.orchestrator.status(workflow.id).await.unwrap_err();
    assert!(matches!(err, FlowError::StoreUnavailable(_)));

    harness.store.set_unavailable(false);
    assert_eq!(
        harness.orchestrator.status(workflow.id).await.unwrap(),
        WorkflowStatus::Pending
    );
}

#[tokio::test]
async fn test_lifecycle_events_are_published_in_order() {
    let mut registry = HandlerRegistry::new();
    registry
        .register("First", SucceedingHandler::new())
        .register("Second", SucceedingHandler::new());
    let harness = TestHarness::new(registry);
    let mut events = harness.events.subscribe();

    let mut builder = WorkflowBuilder::new("events");
    let first = builder.register_job("First", vec![], Dependencies::none());
    let second = builder.register_job("Second", vec![], Dependencies::none().after([first]));
    let workflow = harness.start(builder).await.unwrap();
    harness.drain().await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.meta.workflow_id, workflow.id);
        seen.push(event.payload);
    }

    let expected = vec![
        WorkflowEventPayload::Enqueued {
            job_id: first,
            job_type: "First".into(),
        },
        WorkflowEventPayload::WorkflowStarted {
            workflow_type: "events".into(),
            jobs: 2,
        },
        WorkflowEventPayload::Started {
            job_id: first,
            job_type: "First".into(),
        },
        WorkflowEventPayload::Finished {
            job_id: first,
            job_type: "First".into(),
        },
        WorkflowEventPayload::Enqueued {
            job_id: second,
            job_type: "Second".into(),
        },
        WorkflowEventPayload::Started {
            job_id: second,
            job_type: "Second".into(),
        },
        WorkflowEventPayload::Finished {
            job_id: second,
            job_type: "Second".into(),
        },
    ];
    assert_eq!(seen, expected);
}
