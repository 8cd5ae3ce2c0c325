use thiserror::Error;

use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GridError {
    /// Errors worth retrying with backoff. Everything else is a final answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, GridError::Store(_) | GridError::Io(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for GridError {
    fn from(e: redis::RedisError) -> Self {
        GridError::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_transient() {
        assert!(GridError::Store("connection reset".into()).is_transient());
        assert!(!GridError::JobNotFound("job_1".into()).is_transient());
        assert!(!GridError::Validation("bad".into()).is_transient());
    }

    #[test]
    fn invalid_transition_message_names_both_states() {
        let err = GridError::InvalidTransition {
            job_id: "job_1".into(),
            from: JobStatus::Completed,
            to: JobStatus::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("COMPLETED"));
        assert!(msg.contains("RUNNING"));
    }
}
