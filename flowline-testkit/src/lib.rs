//! Test fixtures for flowline.
//!
//! - [`RecordingExecutor`] captures submissions and replays them through a
//!   [`flowline::LifecycleAdapter`], simulating executor retries.
//! - [`handlers`] holds canned [`flowline::JobHandler`]s.
//! - [`TestHarness`] wires an in-memory orchestrator around both.

pub mod executor;
pub mod handlers;
pub mod harness;

pub use executor::{RecordingExecutor, RunResult, Submission};
pub use handlers::{AbortingHandler, FailingHandler, PayloadWriterHandler, SucceedingHandler};
pub use harness::TestHarness;
