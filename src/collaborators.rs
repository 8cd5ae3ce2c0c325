//! Narrow contracts to the systems around the dispatch core.
//!
//! None of these may hold up a job transition: audit appends run on their own
//! task, and notification failures are logged and dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::aggregator::Reward;
use crate::error::Result;
use crate::scheduler::{Job, JobStatus};
use crate::store::{keys, CoordinationStore};

/// Append-only record of job lifecycle milestones.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record_created(&self, job: &Job) -> Result<()>;

    async fn record_terminal(&self, job: &Job) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum AuditRecord {
    Created(Job),
    Terminal(Job),
}

/// Hand an audit record to its own task. Failures are logged, never returned.
pub fn spawn_audit(audit: Arc<dyn AuditLog>, record: AuditRecord) {
    tokio::spawn(async move {
        let (job_id, outcome) = match &record {
            AuditRecord::Created(job) => (job.job_id.clone(), audit.record_created(job).await),
            AuditRecord::Terminal(job) => (job.job_id.clone(), audit.record_terminal(job).await),
        };
        if let Err(e) = outcome {
            tracing::warn!(job_id = %job_id, error = %e, "Audit append failed");
        }
    });
}

/// Audit log that only emits tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLog;

#[async_trait]
impl AuditLog for TracingAuditLog {
    async fn record_created(&self, job: &Job) -> Result<()> {
        tracing::info!(
            target: "audit",
            job_id = %job.job_id,
            client_id = %job.client_id,
            model = %job.model_name,
            region = %job.region,
            priority = job.priority,
            "Job created"
        );
        Ok(())
    }

    async fn record_terminal(&self, job: &Job) -> Result<()> {
        tracing::info!(
            target: "audit",
            job_id = %job.job_id,
            status = %job.status,
            node_id = job.assigned_node.as_deref().unwrap_or(""),
            error = job.error.as_deref().unwrap_or(""),
            "Job finished"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct AuditLine<'a> {
    event: &'a str,
    at: DateTime<Utc>,
    job: &'a Job,
}

/// Audit log appending one JSON document per line to a file.
#[derive(Debug)]
pub struct JsonLinesAuditLog {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonLinesAuditLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, event: &str, job: &Job) -> Result<()> {
        let mut line = serde_json::to_vec(&AuditLine {
            event,
            at: Utc::now(),
            job,
        })?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditLog for JsonLinesAuditLog {
    async fn record_created(&self, job: &Job) -> Result<()> {
        self.append("created", job).await
    }

    async fn record_terminal(&self, job: &Job) -> Result<()> {
        self.append("terminal", job).await
    }
}

/// Downstream consumer of rewards that are ready to pay out.
#[async_trait]
pub trait SettlementQueue: Send + Sync {
    async fn enqueue_pending(&self, reward: &Reward) -> Result<()>;
}

/// Settlement hand-off through a list in the coordination store.
#[derive(Clone)]
pub struct StoreSettlementQueue {
    store: Arc<dyn CoordinationStore>,
}

impl StoreSettlementQueue {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SettlementQueue for StoreSettlementQueue {
    async fn enqueue_pending(&self, reward: &Reward) -> Result<()> {
        let payload = serde_json::to_string(reward)?;
        self.store.list_push(keys::SETTLEMENT_QUEUE, &payload).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Assigned,
    Completed,
    Failed,
    Cancelled,
}

/// Message published on node and client channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job_id: String,
    pub status: JobStatus,
    pub node_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn for_job(kind: JobEventKind, job: &Job) -> Self {
        Self {
            kind,
            job_id: job.job_id.clone(),
            status: job.status,
            node_id: job.assigned_node.clone(),
            result: job.result.clone(),
            error: job.error.clone(),
            at: Utc::now(),
        }
    }
}

/// Publish an event, logging instead of failing. Returns the receiver count.
pub async fn publish_event(store: &dyn CoordinationStore, channel: &str, event: &JobEvent) -> usize {
    let message = match serde_json::to_string(event) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(job_id = %event.job_id, error = %e, "Could not encode event");
            return 0;
        }
    };
    match store.publish(channel, &message).await {
        Ok(receivers) => receivers,
        Err(e) => {
            tracing::warn!(job_id = %event.job_id, channel, error = %e, "Event publish failed");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobSubmission;
    use crate::store::MemoryStore;

    fn job() -> Job {
        Job::from_submission(JobSubmission::new("client-1", "gpt2", "r1").with_id("J1"))
    }

    #[tokio::test]
    async fn json_lines_log_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = JsonLinesAuditLog::open(&path).await.unwrap();

        let mut job = job();
        log.record_created(&job).await.unwrap();
        job.status = JobStatus::Completed;
        log.record_terminal(&job).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "created");
        assert_eq!(lines[1]["event"], "terminal");
        assert_eq!(lines[1]["job"]["status"], "COMPLETED");
    }

    #[tokio::test]
    async fn settlement_queue_pushes_json() {
        let store = Arc::new(MemoryStore::new());
        let queue = StoreSettlementQueue::new(store.clone());
        let reward = Reward::new(&job(), "N1", 0.05);
        queue.enqueue_pending(&reward).await.unwrap();

        let items = store.list_range(keys::SETTLEMENT_QUEUE, 0, -1).await.unwrap();
        assert_eq!(items.len(), 1);
        let parsed: Reward = serde_json::from_str(&items[0]).unwrap();
        assert_eq!(parsed.job_id, "J1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let store = MemoryStore::new();
        let event = JobEvent::for_job(JobEventKind::Completed, &job());
        assert_eq!(publish_event(&store, "client:c:events", &event).await, 0);
    }
}
