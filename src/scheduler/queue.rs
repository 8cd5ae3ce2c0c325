use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::collaborators::{publish_event, spawn_audit, AuditLog, AuditRecord, JobEvent, JobEventKind};
use crate::context::GridContext;
use crate::error::{GridError, Result};
use crate::registry::NodeRegistry;
use crate::scheduler::job::{field, Job, JobStatus, JobSubmission, PENDING_ALIASES};
use crate::store::{keys, CoordinationStore, FieldGuard};

/// Spacing between priority bands. Sequence numbers stay below it, so a
/// higher priority always sorts first and equal priorities keep FIFO order.
const PRIORITY_STRIDE: f64 = 1e12;

pub fn queue_score(priority: i32, sequence: i64) -> f64 {
    -(priority as f64) * PRIORITY_STRIDE + sequence as f64
}

/// A job id popped from a region queue, with the score it was queued at.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub job_id: String,
    pub score: f64,
}

/// Store-backed job records and per-region priority queues.
///
/// Every status change is a single compare-and-swap on the job's `status`
/// field, so concurrent dispatchers, executors, aggregators and reclaimers
/// never overwrite each other's transitions.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn CoordinationStore>,
    registry: NodeRegistry,
    audit: Arc<dyn AuditLog>,
}

impl JobQueue {
    pub fn new(ctx: &GridContext) -> Self {
        Self {
            store: ctx.store.clone(),
            registry: NodeRegistry::new(ctx),
            audit: ctx.audit.clone(),
        }
    }

    /// Validate, persist and enqueue a new job.
    pub async fn submit(&self, submission: JobSubmission) -> Result<Job> {
        submission.validate()?;
        let job = Job::from_submission(submission);

        if !self
            .store
            .hash_create(&keys::job(&job.job_id), &job.to_fields()?)
            .await?
        {
            return Err(GridError::DuplicateJob(job.job_id));
        }
        self.store
            .zset_add(
                keys::ACTIVE_JOBS,
                &job.job_id,
                job.created_at.timestamp_millis() as f64,
            )
            .await?;
        self.store.zset_add(keys::REGIONS, &job.region, 0.0).await?;
        self.enqueue(&job).await?;

        tracing::info!(
            job_id = %job.job_id,
            client_id = %job.client_id,
            model = %job.model_name,
            region = %job.region,
            priority = job.priority,
            "Job submitted"
        );
        spawn_audit(self.audit.clone(), AuditRecord::Created(job.clone()));
        Ok(job)
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let fields = self.store.hash_get_all(&keys::job(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Job::from_fields(&fields).map(Some)
    }

    pub async fn get_status(&self, job_id: &str) -> Result<Job> {
        self.get(job_id)
            .await?
            .ok_or_else(|| GridError::JobNotFound(job_id.to_string()))
    }

    async fn enqueue(&self, job: &Job) -> Result<f64> {
        let sequence = self.store.incr(keys::QUEUE_SEQUENCE).await?;
        let score = queue_score(job.priority, sequence);
        self.store
            .zset_add(&keys::region_queue(&job.region), &job.job_id, score)
            .await?;
        Ok(score)
    }

    /// Pop up to `n` jobs, highest priority first, waiting up to `wait` for one.
    pub async fn pop_batch(&self, region: &str, n: usize, wait: Duration) -> Result<Vec<QueuedJob>> {
        let popped = self
            .store
            .zset_pop_min(&keys::region_queue(region), n, wait)
            .await?;
        Ok(popped
            .into_iter()
            .map(|(job_id, score)| QueuedJob { job_id, score })
            .collect())
    }

    /// Put a popped job back at its original position.
    pub async fn restore(&self, region: &str, queued: &QueuedJob) -> Result<()> {
        self.store
            .zset_add(&keys::region_queue(region), &queued.job_id, queued.score)
            .await
    }

    /// Re-insert a pending job behind the jobs of its priority already queued.
    pub async fn requeue(&self, job: &Job) -> Result<()> {
        self.enqueue(job).await?;
        tracing::info!(job_id = %job.job_id, region = %job.region, "Job requeued");
        Ok(())
    }

    pub async fn is_queued(&self, region: &str, job_id: &str) -> Result<bool> {
        Ok(self
            .store
            .zset_score(&keys::region_queue(region), job_id)
            .await?
            .is_some())
    }

    pub async fn queue_depth(&self, region: &str) -> Result<usize> {
        Ok(self
            .store
            .zset_range(&keys::region_queue(region), 0, -1)
            .await?
            .len())
    }

    /// Swap the status from one of `from` to `to`. With `owner` set the job
    /// must also still be assigned to that node.
    async fn transition(
        &self,
        job_id: &str,
        from: &[JobStatus],
        to: JobStatus,
        owner: Option<&str>,
        mut updates: Vec<(String, String)>,
    ) -> Result<bool> {
        let mut allowed: Vec<&str> = from
            .iter()
            .filter(|s| s.can_transition(to))
            .map(JobStatus::as_str)
            .collect();
        if allowed.contains(&JobStatus::Pending.as_str()) {
            allowed.extend_from_slice(PENDING_ALIASES);
        }
        updates.push(field("status", to.as_str()));

        let owners: Vec<&str> = owner.into_iter().collect();
        let mut guards: Vec<FieldGuard<'_>> = vec![("status", allowed.as_slice())];
        if !owners.is_empty() {
            guards.push(("assigned_node", owners.as_slice()));
        }
        self.store
            .hash_set_if(&keys::job(job_id), &guards, &updates)
            .await
    }

    /// PENDING -> ASSIGNED. `false` if the job was cancelled or claimed elsewhere.
    pub async fn mark_assigned(&self, job_id: &str, node_id: &str) -> Result<bool> {
        let assigned = self
            .transition(
                job_id,
                &[JobStatus::Pending],
                JobStatus::Assigned,
                None,
                vec![
                    field("assigned_node", node_id),
                    field("assigned_at", Utc::now().to_rfc3339()),
                ],
            )
            .await?;
        if assigned {
            self.store.hash_incr(&keys::job(job_id), "attempts", 1).await?;
        }
        Ok(assigned)
    }

    /// ASSIGNED -> RUNNING on `node_id`. `false` if the assignment was
    /// reclaimed, handed to another node or cancelled.
    pub async fn mark_running(&self, job_id: &str, node_id: &str) -> Result<bool> {
        self.transition(
            job_id,
            &[JobStatus::Assigned],
            JobStatus::Running,
            Some(node_id),
            Vec::new(),
        )
        .await
    }

    /// Apply the outcome `node_id` reported. Allowed from RUNNING, or ASSIGNED
    /// when the result arrives before the start was recorded, and only while
    /// the job is still assigned to that node.
    pub async fn complete(
        &self,
        job_id: &str,
        node_id: &str,
        status: JobStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() || status == JobStatus::Cancelled {
            return Err(GridError::Validation(format!(
                "{status} is not a reportable outcome"
            )));
        }
        let result = match result {
            Some(v) => serde_json::to_string(v)?,
            None => String::new(),
        };
        self.transition(
            job_id,
            &[JobStatus::Running, JobStatus::Assigned],
            status,
            Some(node_id),
            vec![
                field("completed_at", Utc::now().to_rfc3339()),
                field("result", result),
                field("error", error.unwrap_or_default()),
            ],
        )
        .await
    }

    /// ASSIGNED -> PENDING, clearing the assignment.
    pub async fn reclaim(&self, job_id: &str) -> Result<bool> {
        self.transition(
            job_id,
            &[JobStatus::Assigned],
            JobStatus::Pending,
            None,
            vec![field("assigned_node", ""), field("assigned_at", "")],
        )
        .await
    }

    /// RUNNING -> FAILED for a job whose node never reported back.
    pub async fn expire(&self, job_id: &str, error: &str) -> Result<bool> {
        self.transition(
            job_id,
            &[JobStatus::Running],
            JobStatus::Failed,
            None,
            vec![
                field("completed_at", Utc::now().to_rfc3339()),
                field("error", error),
            ],
        )
        .await
    }

    /// Cancel a PENDING or ASSIGNED job.
    ///
    /// A node claim taken for the job is not released here; it lapses on its
    /// TTL or is dropped by the executor when it finds the job cancelled.
    pub async fn cancel(&self, job_id: &str) -> Result<Job> {
        let previous = loop {
            let job = self.get_status(job_id).await?;
            if !job.status.can_transition(JobStatus::Cancelled) {
                return Err(GridError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: job.status,
                    to: JobStatus::Cancelled,
                });
            }
            if self
                .transition(
                    job_id,
                    &[job.status],
                    JobStatus::Cancelled,
                    None,
                    vec![field("completed_at", Utc::now().to_rfc3339())],
                )
                .await?
            {
                break job;
            }
        };

        self.store
            .zset_remove(&keys::region_queue(&previous.region), job_id)
            .await?;
        let job = self.get_status(job_id).await?;
        self.retire(&job).await?;

        tracing::info!(job_id, previous = %previous.status, "Job cancelled");
        publish_event(
            self.store.as_ref(),
            &keys::client_events(&job.client_id),
            &JobEvent::for_job(JobEventKind::Cancelled, &job),
        )
        .await;
        spawn_audit(self.audit.clone(), AuditRecord::Terminal(job.clone()));
        Ok(job)
    }

    /// Ids of non-terminal jobs, oldest first.
    pub async fn active_jobs(&self, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store
            .zset_range(keys::ACTIVE_JOBS, 0, limit as isize - 1)
            .await
    }

    /// Drop a job from the active index. `true` only for the call that removed it.
    pub async fn remove_active(&self, job_id: &str) -> Result<bool> {
        self.store.zset_remove(keys::ACTIVE_JOBS, job_id).await
    }

    /// Release what a terminal job still holds: its active-index entry and
    /// the load unit on its node. A FAILED job also counts against the node.
    ///
    /// The active-index removal gates the rest, so however many passes see
    /// the same terminal job (redelivered results, reclaimer sweeps, a cancel
    /// racing either) the node is released exactly once. Returns `true` for
    /// the pass that did it.
    pub async fn retire(&self, job: &Job) -> Result<bool> {
        if !job.status.is_terminal() || !self.remove_active(&job.job_id).await? {
            return Ok(false);
        }
        if let Some(node_id) = &job.assigned_node {
            if job.status == JobStatus::Failed {
                self.registry.record_outcome(node_id, false, None).await?;
            }
            self.registry.adjust_load(node_id, -1).await?;
        }
        tracing::debug!(job_id = %job.job_id, status = %job.status, "Job retired");
        Ok(true)
    }

    /// Snapshot of the non-terminal jobs in one region.
    pub async fn jobs_in_region(&self, region: &str) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for job_id in self.store.zset_range(keys::ACTIVE_JOBS, 0, -1).await? {
            if let Some(job) = self.get(&job_id).await? {
                if job.region == region {
                    jobs.push(job);
                }
            }
        }
        Ok(jobs)
    }
}
