//! Recovery of jobs whose assignment stopped making progress.
//!
//! The node claim's TTL is the failure detector: an ASSIGNED job whose node
//! no longer holds the claim for it was never picked up and goes back to the
//! queue. Running jobs that outlive the execution deadline are failed. Every
//! change goes through the job's status swap, so racing a late result is a
//! no-op for whichever side loses.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::{ReclaimConfig, RetryConfig};
use crate::context::GridContext;
use crate::error::Result;
use crate::registry::NodeRegistry;
use crate::scheduler::job::is_older_than;
use crate::scheduler::{AssignmentLock, Job, JobQueue, JobStatus};
use crate::shutdown::sleep_or_cancel;
use crate::store::with_retry;

pub const DEADLINE_ERROR: &str = "no result before execution deadline";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// ASSIGNED jobs whose claim lapsed, returned to the queue
    pub requeued: usize,
    /// PENDING jobs that had gone missing from their queue
    pub restored: usize,
    /// RUNNING jobs failed at the execution deadline
    pub expired: usize,
}

pub struct Reclaimer {
    queue: JobQueue,
    registry: NodeRegistry,
    lock: AssignmentLock,
    config: ReclaimConfig,
    running_deadline: Duration,
    retry: RetryConfig,
}

impl Reclaimer {
    pub fn new(ctx: &GridContext) -> Self {
        Self {
            queue: JobQueue::new(ctx),
            registry: NodeRegistry::new(ctx),
            lock: AssignmentLock::new(ctx.store.clone(), ctx.config.dispatch.lock_ttl),
            config: ctx.config.reclaim.clone(),
            running_deadline: ctx.config.running_deadline(),
            retry: ctx.config.retry.clone(),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(interval_ms = self.config.interval.as_millis() as u64, "Reclaimer started");
        loop {
            if !sleep_or_cancel(self.config.interval, &cancel).await {
                break;
            }
            match with_retry(&self.retry, "reclaim", || self.reclaim_once()).await {
                Ok(report) if report != ReclaimReport::default() => tracing::info!(
                    requeued = report.requeued,
                    restored = report.restored,
                    expired = report.expired,
                    "Reclaim pass"
                ),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Reclaim pass failed"),
            }
        }
        tracing::info!("Reclaimer stopped");
    }

    /// Inspect up to `scan_limit` active jobs once.
    pub async fn reclaim_once(&self) -> Result<ReclaimReport> {
        let mut report = ReclaimReport::default();
        let now = Utc::now();

        for job_id in self.queue.active_jobs(self.config.scan_limit).await? {
            let Some(job) = self.queue.get(&job_id).await? else {
                self.queue.remove_active(&job_id).await?;
                continue;
            };
            match job.status {
                JobStatus::Assigned => {
                    if self.reclaim_lapsed(&job).await? {
                        report.requeued += 1;
                    }
                }
                JobStatus::Pending => {
                    if self.restore_missing(&job, now).await? {
                        report.restored += 1;
                    }
                }
                JobStatus::Running => {
                    if self.expire_overdue(&job, now).await? {
                        report.expired += 1;
                    }
                }
                // Left behind by an interrupted terminal transition.
                _ => {
                    if self.queue.retire(&job).await? {
                        tracing::info!(job_id = %job_id, status = %job.status, "Released a finished job's node");
                    }
                }
            }
        }

        Ok(report)
    }

    async fn reclaim_lapsed(&self, job: &Job) -> Result<bool> {
        let Some(node_id) = job.assigned_node.as_deref() else {
            return Ok(false);
        };
        if self.lock.is_held_for(node_id, &job.job_id).await? {
            return Ok(false);
        }
        if !self.queue.reclaim(&job.job_id).await? {
            return Ok(false);
        }
        self.queue.requeue(job).await?;
        self.registry.adjust_load(node_id, -1).await?;
        tracing::warn!(job_id = %job.job_id, node_id, attempts = job.attempts, "Assignment lapsed, job reclaimed");
        Ok(true)
    }

    async fn restore_missing(&self, job: &Job, now: DateTime<Utc>) -> Result<bool> {
        if !is_older_than(job.created_at, now, self.config.pending_deadline) {
            return Ok(false);
        }
        if self.queue.is_queued(&job.region, &job.job_id).await? {
            return Ok(false);
        }
        // A dispatcher may hold it popped right now; re-check after the read.
        match self.queue.get(&job.job_id).await? {
            Some(current) if current.status == JobStatus::Pending => {}
            _ => return Ok(false),
        }
        self.queue.requeue(job).await?;
        tracing::warn!(job_id = %job.job_id, region = %job.region, "Pending job was missing from its queue");
        Ok(true)
    }

    async fn expire_overdue(&self, job: &Job, now: DateTime<Utc>) -> Result<bool> {
        let Some(assigned_at) = job.assigned_at else {
            return Ok(false);
        };
        if !is_older_than(assigned_at, now, self.running_deadline) {
            return Ok(false);
        }
        if !self.queue.expire(&job.job_id, DEADLINE_ERROR).await? {
            return Ok(false);
        }
        let failed = self.queue.get_status(&job.job_id).await?;
        self.queue.retire(&failed).await?;
        tracing::warn!(job_id = %job.job_id, node = job.assigned_node.as_deref().unwrap_or(""), "Running job passed its deadline, failed");
        Ok(true)
    }
}
