use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::aggregator::reward::{Reward, RewardLedger, RewardStatus};
use crate::collaborators::SettlementQueue;
use crate::config::RetryConfig;
use crate::context::GridContext;
use crate::error::Result;
use crate::shutdown::sleep_or_cancel;
use crate::store::with_retry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributionReport {
    pub distributed: usize,
    /// Claimed by another distributor or already distributed
    pub skipped: usize,
    /// Hand-off failed; left pending for the next pass
    pub failed: usize,
}

enum Acquired {
    Send(Reward),
    /// Claimed by another distributor that may still hand it off
    InFlight,
    /// Gone or already distributed; its index entry was removed
    Dropped,
}

/// Hands pending rewards to settlement.
///
/// A reward is claimed while still PENDING and only marked DISTRIBUTED after
/// settlement accepted it, so a DISTRIBUTED reward is never sent again.
/// A claim whose distributor stopped before that mark is taken over after the
/// claim timeout and sent again. Delivery is therefore at-least-once and
/// settlement must treat a repeated job id as the same reward.
pub struct RewardDistributor {
    ledger: RewardLedger,
    settlement: Arc<dyn SettlementQueue>,
    interval: Duration,
    batch_size: usize,
    claim_timeout: Duration,
    retry: RetryConfig,
}

impl RewardDistributor {
    pub fn new(ctx: &GridContext) -> Self {
        Self {
            ledger: RewardLedger::new(ctx.store.clone()),
            settlement: ctx.settlement.clone(),
            interval: ctx.config.rewards.distribution_interval,
            batch_size: ctx.config.rewards.batch_size,
            claim_timeout: ctx.config.rewards.claim_timeout,
            retry: ctx.config.retry.clone(),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("Reward distributor started");
        loop {
            match self.distribute_pending().await {
                Ok(report) if report.distributed + report.failed > 0 => tracing::info!(
                    distributed = report.distributed,
                    failed = report.failed,
                    skipped = report.skipped,
                    "Rewards distributed"
                ),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Reward distribution failed"),
            }
            if !sleep_or_cancel(self.interval, &cancel).await {
                break;
            }
        }
        tracing::info!("Reward distributor stopped");
    }

    /// Hand up to `batch_size` rewards to settlement.
    ///
    /// Entries still claimed by someone else do not count against the batch,
    /// so the index is read past them until the batch is full or the index
    /// runs out.
    pub async fn distribute_pending(&self) -> Result<DistributionReport> {
        let mut report = DistributionReport::default();
        let mut offset = 0;

        while report.distributed + report.failed < self.batch_size {
            let page = self.ledger.pending_from(offset, self.batch_size).await?;
            if page.is_empty() {
                break;
            }
            for job_id in page {
                if report.distributed + report.failed >= self.batch_size {
                    break;
                }
                let reward = match self.acquire(&job_id).await? {
                    Acquired::Send(reward) => reward,
                    Acquired::InFlight => {
                        // Still indexed; the next page starts after it.
                        offset += 1;
                        report.skipped += 1;
                        continue;
                    }
                    Acquired::Dropped => {
                        report.skipped += 1;
                        continue;
                    }
                };

                match self.settlement.enqueue_pending(&reward).await {
                    Ok(()) => {
                        self.finish(&job_id).await;
                        tracing::debug!(job_id = %job_id, node_id = %reward.node_id, amount = reward.amount, "Reward handed to settlement");
                        report.distributed += 1;
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Settlement hand-off failed, releasing claim");
                        self.ledger.release(&reward).await?;
                        offset += 1;
                        report.failed += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Claim a pending reward, or take over an expired claim.
    async fn acquire(&self, job_id: &str) -> Result<Acquired> {
        if let Some(reward) = self.ledger.claim(job_id, self.claim_timeout).await? {
            return Ok(Acquired::Send(reward));
        }
        match self.ledger.get(job_id).await? {
            Some(reward) if reward.status == RewardStatus::Pending => Ok(Acquired::InFlight),
            Some(_) => {
                tracing::debug!(job_id, "Dropping index entry of a distributed reward");
                self.ledger.unindex(job_id).await?;
                Ok(Acquired::Dropped)
            }
            None => {
                self.ledger.unindex(job_id).await?;
                Ok(Acquired::Dropped)
            }
        }
    }

    /// Record a successful hand-off. Failures are logged; a reward left
    /// PENDING is sent again once its claim expires.
    async fn finish(&self, job_id: &str) {
        if let Err(e) = with_retry(&self.retry, "mark reward distributed", || {
            self.ledger.mark_distributed(job_id)
        })
        .await
        {
            tracing::error!(job_id, error = %e, "Could not mark reward distributed");
            return;
        }
        if let Err(e) = with_retry(&self.retry, "unindex reward", || self.ledger.unindex(job_id)).await {
            tracing::error!(job_id, error = %e, "Could not unindex distributed reward");
        }
    }
}
