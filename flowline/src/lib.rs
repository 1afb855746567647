//! Flowline - dependency-aware workflow orchestration on top of a job executor.
//!
//! A workflow is a directed acyclic graph of jobs. Flowline persists the
//! graph, hands ready jobs to an external executor and, as each job
//! finishes, works out which successors have become ready and dispatches
//! them exactly once.
//!
//! # Core Concepts
//!
//! - **Job**: A [`JobRecord`] is one node of the graph: its type, arguments,
//!   predecessor and successor ids, and the lifecycle timestamps from which
//!   its [`JobStatus`] is derived.
//!
//! - **Workflow**: A [`Workflow`] groups job records under a [`WorkflowId`].
//!   Workflows are assembled with a [`WorkflowBuilder`], usually from a
//!   [`WorkflowDefinition`], and report an aggregate [`WorkflowStatus`].
//!
//! - **Store**: The [`WorkflowStore`] trait abstracts persistence of workflows,
//!   jobs and the per-workflow payload namespace. [`InMemoryStore`] ships
//!   with the crate.
//!
//! - **Lock**: Ready-job evaluation for a workflow runs under a
//!   [`LockProvider`] lock so concurrent finishes never dispatch a
//!   successor twice.
//!
//! - **Executor**: The [`JobExecutor`] trait is the seam to whatever
//!   actually runs jobs. Executors call back into a [`LifecycleAdapter`],
//!   which runs the registered [`JobHandler`] and drives the lifecycle.
//!
//! - **Events**: Lifecycle transitions are published as [`WorkflowEvent`]s
//!   through an optional [`EventPublisher`] such as [`InProcEventBus`].
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL store and lock provider via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use flowline::*;
//!
//! let orchestrator = Orchestrator::builder(OrchestratorConfig::default())
//!     .with_store(Arc::new(InMemoryStore::default()))
//!     .with_locks(Arc::new(InMemoryLockProvider::new()))
//!     .with_executor(executor)
//!     .build()?;
//!
//! let mut builder = WorkflowBuilder::new("ingest");
//! let fetch = builder.register_job("Fetch", vec![], Dependencies::none());
//! builder.register_job("Parse", vec![], Dependencies::none().after([fetch]));
//! let workflow = orchestrator.start_builder(builder).await?;
//! ```

/// Lifecycle callbacks invoked by executors.
///
/// The `adapter` module provides [`LifecycleAdapter`], which wraps a job's
/// handler with the start, success, error and abort transitions, and the
/// [`JobContext`] handed to handlers.
pub mod adapter;

/// Configuration structures for the store, locks and persistence.
pub mod config;

/// Ready-job evaluation and dispatch.
///
/// The `dispatch` module provides [`ReadyJobDispatcher`], which enqueues
/// jobs, submits them to the executor, and evaluates successors of
/// finished jobs under the workflow lock.
pub mod dispatch;

/// Error types shared by every module.
pub mod error;

/// Event publishing and subscription system.
///
/// The `events` module provides:
/// - [`EventPublisher`] and [`EventSubscriber`] for pub/sub patterns
/// - [`WorkflowEvent`] and [`WorkflowEventPayload`] for event data
/// - [`InProcEventBus`] for in-process event broadcasting
pub mod events;

/// The seam to the external job executor.
pub mod executor;

/// Job records, identifiers and derived status.
pub mod job;

/// Keyed TTL locks.
///
/// The `lock` module defines the [`LockProvider`] trait, the [`with_lock`]
/// helper and [`InMemoryLockProvider`].
pub mod lock;

#[cfg(feature = "metrics")]
/// Prometheus metrics for dispatch, outcomes and lock contention.
pub mod metrics;

/// Workflow-level operations.
///
/// The `orchestrator` module provides [`Orchestrator`] and its builder:
/// starting workflows, status queries, restarts and waiting.
pub mod orchestrator;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides PostgreSQL-backed implementations
/// of the store and lock provider when the `postgres` feature is enabled.
pub mod persistence;

/// Job type to handler resolution.
pub mod registry;

/// Persistence of workflows, jobs and payloads.
///
/// The `store` module defines the [`WorkflowStore`] trait, the record
/// codec, the key layout and [`InMemoryStore`].
pub mod store;

/// Tracing setup and instrumentation helpers.
pub mod telemetry;

/// Workflow graphs and their construction.
///
/// The `workflow` module defines [`Workflow`], [`WorkflowStatus`],
/// [`WorkflowBuilder`] and the [`WorkflowDefinition`] trait.
pub mod workflow;

pub use adapter::*;
pub use config::*;
pub use dispatch::*;
pub use error::{FlowError, Result};
pub use events::*;
pub use executor::*;
pub use job::*;
pub use lock::*;
pub use orchestrator::*;
pub use registry::*;
pub use store::{update_job, InMemoryStore, Keyspace, PayloadType, PayloadValue, WorkflowStore};
pub use telemetry::init_tracing;
pub use workflow::*;

#[cfg(feature = "postgres")]
pub use persistence::{PostgresLockProvider, PostgresStore};
