use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::collaborators::{publish_event, JobEvent, JobEventKind};
use crate::config::{DispatchConfig, RetryConfig};
use crate::context::GridContext;
use crate::error::Result;
use crate::registry::{Node, NodeRegistry, NodeStatus};
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::lock::AssignmentLock;
use crate::scheduler::queue::{JobQueue, QueuedJob};
use crate::shutdown::sleep_or_cancel;
use crate::store::{keys, with_retry, CoordinationStore};

/// What one dispatch cycle did with the jobs it popped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub popped: usize,
    pub assigned: usize,
    /// Put back because no candidate could be claimed
    pub deferred: usize,
    /// Discarded because the job was gone or no longer pending
    pub dropped: usize,
}

impl DispatchReport {
    /// Nothing could be placed although work was waiting.
    pub fn is_backpressured(&self) -> bool {
        self.deferred > 0 && self.assigned == 0
    }
}

enum Placement {
    Assigned,
    NoCandidate,
    Dropped,
}

/// Assigns queued jobs of one region to the best claimable node.
///
/// Any number of dispatchers may serve the same region, in this process or
/// others. The node claim taken through [`AssignmentLock`] is what keeps two
/// of them from assigning the same node; the PENDING-guarded status swap
/// keeps a job from being assigned twice.
pub struct Dispatcher {
    region: String,
    store: Arc<dyn CoordinationStore>,
    queue: JobQueue,
    registry: NodeRegistry,
    lock: AssignmentLock,
    config: DispatchConfig,
    retry: RetryConfig,
}

impl Dispatcher {
    pub fn new(ctx: &GridContext, region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            store: ctx.store.clone(),
            queue: JobQueue::new(ctx),
            registry: NodeRegistry::new(ctx),
            lock: AssignmentLock::new(ctx.store.clone(), ctx.config.dispatch.lock_ttl),
            config: ctx.config.dispatch.clone(),
            retry: ctx.config.retry.clone(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(region = %self.region, "Dispatcher started");

        loop {
            let popped = tokio::select! {
                _ = cancel.cancelled() => break,
                popped = with_retry(&self.retry, "pop_batch", || {
                    self.queue.pop_batch(&self.region, self.config.batch_size, self.config.poll_wait)
                }) => popped,
            };

            let outcome = match popped {
                Ok(batch) if batch.is_empty() => continue,
                Ok(batch) => self.dispatch_batch(batch).await,
                Err(e) => Err(e),
            };

            let pause = match outcome {
                Ok(report) if report.is_backpressured() => {
                    tracing::warn!(
                        region = %self.region,
                        deferred = report.deferred,
                        "No claimable node, backing off"
                    );
                    true
                }
                Ok(report) => {
                    tracing::debug!(
                        region = %self.region,
                        popped = report.popped,
                        assigned = report.assigned,
                        deferred = report.deferred,
                        dropped = report.dropped,
                        "Dispatch cycle"
                    );
                    false
                }
                Err(e) => {
                    tracing::error!(region = %self.region, error = %e, "Dispatch cycle failed");
                    true
                }
            };

            if pause && !sleep_or_cancel(self.config.retry_backoff, &cancel).await {
                break;
            }
        }

        tracing::info!(region = %self.region, "Dispatcher stopped");
    }

    /// Pop one batch (waiting up to `poll_wait`) and try to place every job in it.
    pub async fn dispatch_cycle(&self) -> Result<DispatchReport> {
        let batch = self
            .queue
            .pop_batch(&self.region, self.config.batch_size, self.config.poll_wait)
            .await?;
        if batch.is_empty() {
            return Ok(DispatchReport::default());
        }
        self.dispatch_batch(batch).await
    }

    async fn dispatch_batch(&self, batch: Vec<QueuedJob>) -> Result<DispatchReport> {
        let mut report = DispatchReport {
            popped: batch.len(),
            ..DispatchReport::default()
        };

        let candidates = match self.registry.candidates(&self.region).await {
            Ok(candidates) => candidates,
            Err(e) => {
                self.restore_all(&batch).await;
                return Err(e);
            }
        };

        let mut nodes: HashMap<String, Option<Node>> = HashMap::new();
        for (index, queued) in batch.iter().enumerate() {
            match self.place(queued, &candidates, &mut nodes).await {
                Ok(Placement::Assigned) => report.assigned += 1,
                Ok(Placement::Dropped) => report.dropped += 1,
                Ok(Placement::NoCandidate) => {
                    self.queue.restore(&self.region, queued).await?;
                    report.deferred += 1;
                }
                Err(e) => {
                    self.restore_all(&batch[index..]).await;
                    return Err(e);
                }
            }
        }
        Ok(report)
    }

    async fn restore_all(&self, batch: &[QueuedJob]) {
        for queued in batch {
            if let Err(e) = self.queue.restore(&self.region, queued).await {
                // The reclaimer requeues pending jobs missing from their queue.
                tracing::error!(job_id = %queued.job_id, error = %e, "Could not restore popped job");
            }
        }
    }

    async fn place(
        &self,
        queued: &QueuedJob,
        candidates: &[String],
        nodes: &mut HashMap<String, Option<Node>>,
    ) -> Result<Placement> {
        let Some(mut job) = self.queue.get(&queued.job_id).await? else {
            tracing::warn!(job_id = %queued.job_id, "Queued job has no record, dropping");
            return Ok(Placement::Dropped);
        };
        if job.status != JobStatus::Pending {
            tracing::debug!(job_id = %job.job_id, status = %job.status, "Queued job no longer pending");
            return Ok(Placement::Dropped);
        }

        for node_id in candidates {
            if !nodes.contains_key(node_id) {
                let node = self.registry.get_node(node_id).await?;
                nodes.insert(node_id.clone(), node);
            }
            let Some(Some(node)) = nodes.get_mut(node_id) else {
                continue;
            };
            if !self.is_eligible(node, &job).await? {
                continue;
            }
            if !self.lock.acquire(node_id, &job.job_id).await? {
                tracing::debug!(job_id = %job.job_id, node_id, "Node already claimed");
                continue;
            }

            if !self.queue.mark_assigned(&job.job_id, node_id).await? {
                self.lock.release(node_id, &job.job_id).await?;
                tracing::info!(job_id = %job.job_id, node_id, "Job left PENDING before assignment, dropping");
                return Ok(Placement::Dropped);
            }

            node.current_load = self.registry.adjust_load(node_id, 1).await?;
            self.store
                .list_push(&keys::node_jobs(node_id), &job.job_id)
                .await?;

            job.status = JobStatus::Assigned;
            job.assigned_node = Some(node_id.clone());
            publish_event(
                self.store.as_ref(),
                &keys::node_events(node_id),
                &JobEvent::for_job(JobEventKind::Assigned, &job),
            )
            .await;

            tracing::info!(
                job_id = %job.job_id,
                node_id,
                region = %self.region,
                priority = job.priority,
                "Job assigned"
            );
            return Ok(Placement::Assigned);
        }

        Ok(Placement::NoCandidate)
    }

    async fn is_eligible(&self, node: &Node, job: &Job) -> Result<bool> {
        if node.status == NodeStatus::Offline
            || !node.capabilities.supports(&job.model_name)
            || !node.has_spare_concurrency()
        {
            return Ok(false);
        }
        self.registry.is_live(&node.node_id).await
    }
}
