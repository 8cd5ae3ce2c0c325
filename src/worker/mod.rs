//! Node-side half of the grid.
//!
//! # Components
//!
//! - [`NodeExecutor`]: pops assignments, runs them through a [`ModelRunner`]
//!   and reports a [`JobResult`]
//! - [`HeartbeatSender`]: registration, lease refresh and sign-off
//! - [`ResultReporter`]: pushes results onto the shared results list
//!
//! # Execution Flow
//!
//! 1. The dispatcher pushes a job id onto `node:{id}:jobs`
//! 2. [`NodeExecutor::handle_assignment`] moves the job to RUNNING
//! 3. The runner executes under `execution_timeout`
//! 4. The result is reported and the node claim released

pub mod executor;
pub mod heartbeat;
pub mod report;
pub mod runner;

pub use executor::{ExecutorStats, NodeExecutor};
pub use heartbeat::HeartbeatSender;
pub use report::{JobResult, ResultReporter};
pub use runner::{EchoRunner, ExecutionError, ModelRunner};
