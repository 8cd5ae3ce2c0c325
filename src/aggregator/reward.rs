use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::scheduler::job::{field, is_older_than, opt_time, parse_field, parse_time};
use crate::scheduler::Job;
use crate::store::{keys, CoordinationStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RewardStatus {
    Pending,
    Distributed,
}

impl RewardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardStatus::Pending => "PENDING",
            RewardStatus::Distributed => "DISTRIBUTED",
        }
    }
}

impl fmt::Display for RewardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RewardStatus {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(RewardStatus::Pending),
            "DISTRIBUTED" => Ok(RewardStatus::Distributed),
            other => Err(GridError::Validation(format!("unknown reward status {other:?}"))),
        }
    }
}

/// Reward owed to a node for one completed job.
pub fn reward_amount(base_rate: f64, priority: i32) -> f64 {
    base_rate * priority.max(1) as f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    pub job_id: String,
    pub node_id: String,
    pub client_id: String,
    pub amount: f64,
    pub status: RewardStatus,
    pub created_at: DateTime<Utc>,
    pub distributed_at: Option<DateTime<Utc>>,
    /// When a distributor last claimed the reward for hand-off
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Reward {
    pub fn new(job: &Job, node_id: impl Into<String>, amount: f64) -> Self {
        Self {
            job_id: job.job_id.clone(),
            node_id: node_id.into(),
            client_id: job.client_id.clone(),
            amount,
            status: RewardStatus::Pending,
            created_at: Utc::now(),
            distributed_at: None,
            claimed_at: None,
        }
    }

    /// Record fields for a new reward. The node has not been credited yet.
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            field("job_id", &self.job_id),
            field("node_id", &self.node_id),
            field("client_id", &self.client_id),
            field("amount", self.amount.to_string()),
            field("status", self.status.as_str()),
            field("created_at", self.created_at.to_rfc3339()),
            field("distributed_at", opt_time(self.distributed_at)),
            field("claimed_at", opt_time(self.claimed_at)),
            field("credited", FALSE),
        ]
    }

    fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| -> Result<&str> {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| GridError::Validation(format!("reward record missing {name}")))
        };
        Ok(Self {
            job_id: get("job_id")?.to_string(),
            node_id: get("node_id")?.to_string(),
            client_id: get("client_id")?.to_string(),
            amount: parse_field("amount", get("amount")?)?,
            status: get("status")?.parse()?,
            created_at: parse_time("created_at", get("created_at")?)?,
            distributed_at: fields
                .get("distributed_at")
                .filter(|v| !v.is_empty())
                .map(|v| parse_time("distributed_at", v))
                .transpose()?,
            claimed_at: fields
                .get("claimed_at")
                .filter(|v| !v.is_empty())
                .map(|v| parse_time("claimed_at", v))
                .transpose()?,
        })
    }
}

const TRUE: &str = "true";
const FALSE: &str = "false";

/// Reward records keyed by job id. At most one can ever exist per job.
#[derive(Clone)]
pub struct RewardLedger {
    store: Arc<dyn CoordinationStore>,
}

impl RewardLedger {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Create the reward unless one already exists, and make sure a reward
    /// still PENDING is in the distribution index. Returns `true` on creation.
    ///
    /// Calling it again for the same job repairs an index entry lost when an
    /// earlier call failed between the two writes.
    pub async fn create(&self, reward: &Reward) -> Result<bool> {
        let created = self
            .store
            .hash_create(&keys::reward(&reward.job_id), &reward.to_fields())
            .await?;
        let stored = if created {
            Some(reward.clone())
        } else {
            self.get(&reward.job_id).await?
        };
        if let Some(stored) = stored.filter(|r| r.status == RewardStatus::Pending) {
            self.store
                .zset_add(
                    keys::PENDING_REWARDS,
                    &stored.job_id,
                    stored.created_at.timestamp_millis() as f64,
                )
                .await?;
        }
        Ok(created)
    }

    /// Flip the reward's one-shot credit marker. Only the call that gets
    /// `true` may credit the node.
    pub async fn mark_credited(&self, job_id: &str) -> Result<bool> {
        self.store
            .hash_set_if(
                &keys::reward(job_id),
                &[("credited", &[FALSE])],
                &[field("credited", TRUE)],
            )
            .await
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Reward>> {
        let fields = self.store.hash_get_all(&keys::reward(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Reward::from_fields(&fields).map(Some)
    }

    /// Job ids of rewards awaiting distribution, oldest first.
    pub async fn pending(&self, limit: usize) -> Result<Vec<String>> {
        self.pending_from(0, limit).await
    }

    /// Like [`pending`](Self::pending), skipping the first `offset` entries.
    pub async fn pending_from(&self, offset: usize, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store
            .zset_range(
                keys::PENDING_REWARDS,
                offset as isize,
                (offset + limit) as isize - 1,
            )
            .await
    }

    /// Claim a PENDING reward for hand-off. A claim older than `timeout` is
    /// taken over, since its distributor never finished. Returns the reward
    /// when this call holds the claim.
    pub async fn claim(&self, job_id: &str, timeout: Duration) -> Result<Option<Reward>> {
        let fields = self.store.hash_get_all(&keys::reward(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let reward = Reward::from_fields(&fields)?;
        if reward.status != RewardStatus::Pending {
            return Ok(None);
        }
        let now = Utc::now();
        if let Some(claimed_at) = reward.claimed_at {
            if !is_older_than(claimed_at, now, timeout) {
                return Ok(None);
            }
            tracing::warn!(job_id, %claimed_at, "Taking over an expired reward claim");
        }

        let seen = fields.get("claimed_at").map(String::as_str).unwrap_or_default();
        let claimed = self
            .store
            .hash_set_if(
                &keys::reward(job_id),
                &[
                    ("status", &[RewardStatus::Pending.as_str()]),
                    ("claimed_at", &[seen]),
                ],
                &[field("claimed_at", now.to_rfc3339())],
            )
            .await?;
        Ok(claimed.then_some(Reward {
            claimed_at: Some(now),
            ..reward
        }))
    }

    /// PENDING -> DISTRIBUTED once settlement accepted the reward.
    pub async fn mark_distributed(&self, job_id: &str) -> Result<bool> {
        self.store
            .hash_set_if(
                &keys::reward(job_id),
                &[("status", &[RewardStatus::Pending.as_str()])],
                &[
                    field("status", RewardStatus::Distributed.as_str()),
                    field("distributed_at", Utc::now().to_rfc3339()),
                ],
            )
            .await
    }

    /// Drop the claim held by `claimed`, so the next pass can retry at once.
    pub async fn release(&self, claimed: &Reward) -> Result<bool> {
        let ours = opt_time(claimed.claimed_at);
        self.store
            .hash_set_if(
                &keys::reward(&claimed.job_id),
                &[
                    ("status", &[RewardStatus::Pending.as_str()]),
                    ("claimed_at", &[ours.as_str()]),
                ],
                &[field("claimed_at", "")],
            )
            .await
    }

    pub async fn unindex(&self, job_id: &str) -> Result<bool> {
        self.store.zset_remove(keys::PENDING_REWARDS, job_id).await
    }
}
