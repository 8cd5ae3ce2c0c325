//! Job lifecycle and dispatch.
//!
//! - [`job`]: the job record and its state machine
//! - [`queue`]: store-backed job records and per-region priority queues
//! - [`lock`]: the per-node assignment claim
//! - [`dispatcher`]: the loop matching queued jobs to ranked nodes

pub mod dispatcher;
pub mod job;
pub mod lock;
pub mod queue;

pub use dispatcher::{DispatchReport, Dispatcher};
pub use job::{Job, JobStatus, JobSubmission};
pub use lock::AssignmentLock;
pub use queue::{JobQueue, QueuedJob};
