//! Result aggregation and reward accounting.
//!
//! Results may arrive more than once, late, or from a node that lost its
//! assignment. Handling is idempotent: the terminal status swap happens at
//! most once per job, the node's load is released by whichever pass removes
//! the job from the active index, and the node is credited by whichever pass
//! flips the reward's credit marker. A redelivery after an interrupted pass
//! finishes the remaining steps and changes nothing else.

pub mod distributor;
pub mod reward;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::collaborators::{publish_event, spawn_audit, AuditLog, AuditRecord, JobEvent, JobEventKind};
use crate::config::{RetryConfig, RewardConfig};
use crate::context::GridContext;
use crate::error::Result;
use crate::registry::NodeRegistry;
use crate::scheduler::{Job, JobQueue, JobStatus};
use crate::shutdown::sleep_or_cancel;
use crate::store::{keys, with_retry, CoordinationStore};
use crate::worker::JobResult;

pub use distributor::{DistributionReport, RewardDistributor};
pub use reward::{reward_amount, Reward, RewardLedger, RewardStatus};

/// What handling one result did.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultOutcome {
    Completed { reward: Option<Reward> },
    Failed { error: String },
    /// The job was already terminal; nothing changed
    Duplicate,
    UnknownJob,
    /// Reported by a node the job is not assigned to
    StaleNode,
}

pub struct ResultAggregator {
    store: Arc<dyn CoordinationStore>,
    queue: JobQueue,
    registry: NodeRegistry,
    ledger: RewardLedger,
    audit: Arc<dyn AuditLog>,
    rewards: RewardConfig,
    poll_wait: Duration,
    retry: RetryConfig,
}

impl ResultAggregator {
    pub fn new(ctx: &GridContext) -> Self {
        Self {
            store: ctx.store.clone(),
            queue: JobQueue::new(ctx),
            registry: NodeRegistry::new(ctx),
            ledger: RewardLedger::new(ctx.store.clone()),
            audit: ctx.audit.clone(),
            rewards: ctx.config.rewards.clone(),
            poll_wait: ctx.config.dispatch.poll_wait,
            retry: ctx.config.retry.clone(),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("Result aggregator started");
        loop {
            let popped = tokio::select! {
                _ = cancel.cancelled() => break,
                popped = self.store.list_pop(keys::RESULTS, self.poll_wait) => popped,
            };

            let raw = match popped {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "Polling results failed");
                    if !sleep_or_cancel(self.retry.backoff, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let result: JobResult = match serde_json::from_str(&raw) {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(error = %e, payload = %raw, "Discarding malformed result");
                    continue;
                }
            };

            if let Err(e) = self.handle_result(result).await {
                tracing::error!(error = %e, "Result handling failed, returning it to the queue");
                // Handling is idempotent, so a second pass finishes what this one started.
                if let Err(e) = self.store.list_push(keys::RESULTS, &raw).await {
                    tracing::error!(error = %e, "Could not return result to the queue");
                }
                if !sleep_or_cancel(self.retry.backoff, &cancel).await {
                    break;
                }
            }
        }
        tracing::info!("Result aggregator stopped");
    }

    pub async fn handle_result(&self, result: JobResult) -> Result<ResultOutcome> {
        let Some(job) = self.queue.get(&result.job_id).await? else {
            tracing::warn!(job_id = %result.job_id, node_id = %result.node_id, "Result for unknown job");
            return Ok(ResultOutcome::UnknownJob);
        };
        let from_assignee = job.assigned_node.as_deref() == Some(result.node_id.as_str());

        if job.status.is_terminal() {
            // A redelivery can still finish the bookkeeping of an interrupted first pass.
            if job.status == JobStatus::Completed && from_assignee {
                self.settle_reward(&job, &result.node_id).await?;
            }
            if self.queue.retire(&job).await? && job.status != JobStatus::Cancelled {
                self.announce(&job).await;
            }
            tracing::debug!(job_id = %job.job_id, status = %job.status, "Duplicate result");
            return Ok(ResultOutcome::Duplicate);
        }
        if !from_assignee {
            tracing::warn!(
                job_id = %job.job_id,
                node_id = %result.node_id,
                assigned_node = job.assigned_node.as_deref().unwrap_or(""),
                "Result from a node that does not hold the job, discarding"
            );
            return Ok(ResultOutcome::StaleNode);
        }

        let (status, output, error) = match (result.success, result.output) {
            (true, Some(output)) if !output.is_null() => (JobStatus::Completed, Some(output), None),
            (true, _) => (JobStatus::Failed, None, Some("missing output".to_string())),
            (false, _) => (
                JobStatus::Failed,
                None,
                Some(result.error.unwrap_or_else(|| "execution failed".to_string())),
            ),
        };

        if !self
            .queue
            .complete(
                &job.job_id,
                &result.node_id,
                status,
                output.as_ref(),
                error.as_deref(),
            )
            .await?
        {
            tracing::debug!(job_id = %job.job_id, "Lost the terminal transition race");
            return Ok(ResultOutcome::Duplicate);
        }
        let job = self.queue.get_status(&job.job_id).await?;

        let outcome = match status {
            JobStatus::Completed => ResultOutcome::Completed {
                reward: self.settle_reward(&job, &result.node_id).await?,
            },
            _ => ResultOutcome::Failed {
                error: error.unwrap_or_default(),
            },
        };
        self.queue.retire(&job).await?;
        self.announce(&job).await;

        tracing::info!(
            job_id = %job.job_id,
            node_id = %result.node_id,
            status = %status,
            execution_time_ms = result.execution_time_ms,
            "Job finished"
        );
        Ok(outcome)
    }

    /// Tell the client and the audit log about a finished job.
    async fn announce(&self, job: &Job) {
        let kind = if job.status == JobStatus::Completed {
            JobEventKind::Completed
        } else {
            JobEventKind::Failed
        };
        publish_event(
            self.store.as_ref(),
            &keys::client_events(&job.client_id),
            &JobEvent::for_job(kind, job),
        )
        .await;
        spawn_audit(self.audit.clone(), AuditRecord::Terminal(job.clone()));
    }

    /// Make sure the job's reward exists and is indexed, and credit the node
    /// if no earlier pass did. Returns the reward only when this call created it.
    async fn settle_reward(&self, job: &Job, node_id: &str) -> Result<Option<Reward>> {
        let amount = reward_amount(self.rewards.base_rate, job.priority);
        let reward = Reward::new(job, node_id, amount);
        let created = self.ledger.create(&reward).await?;
        if self.ledger.mark_credited(&job.job_id).await? {
            with_retry(&self.retry, "credit node", || {
                self.registry.record_outcome(node_id, true, Some(amount))
            })
            .await?;
            tracing::info!(job_id = %job.job_id, node_id, amount, "Reward created");
        }
        Ok(created.then_some(reward))
    }
}
