use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RetryConfig;
use crate::error::Result;
use crate::store::{keys, with_retry, CoordinationStore};

/// Outcome of one execution, as reported by the node that ran it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub node_id: String,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub reported_at: DateTime<Utc>,
}

impl JobResult {
    pub fn success(job_id: impl Into<String>, node_id: impl Into<String>, output: Value, execution_time_ms: u64) -> Self {
        Self {
            job_id: job_id.into(),
            node_id: node_id.into(),
            success: true,
            output: Some(output),
            error: None,
            execution_time_ms,
            reported_at: Utc::now(),
        }
    }

    pub fn failure(
        job_id: impl Into<String>,
        node_id: impl Into<String>,
        error: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            node_id: node_id.into(),
            success: false,
            output: None,
            error: Some(error.into()),
            execution_time_ms,
            reported_at: Utc::now(),
        }
    }
}

/// Pushes results onto the shared results list for the aggregator.
#[derive(Clone)]
pub struct ResultReporter {
    store: Arc<dyn CoordinationStore>,
    retry: RetryConfig,
}

impl ResultReporter {
    pub fn new(store: Arc<dyn CoordinationStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    pub async fn report(&self, result: &JobResult) -> Result<()> {
        let payload = serde_json::to_string(result)?;
        with_retry(&self.retry, "report_result", || {
            self.store.list_push(keys::RESULTS, &payload)
        })
        .await
    }
}
