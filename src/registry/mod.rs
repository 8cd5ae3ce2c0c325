//! Node registry: membership, liveness leases and candidate ranking.
//!
//! A node is live exactly while its lease key exists. Heartbeats refresh the
//! lease; nothing else marks a node dead. Rankings are recomputed on a fixed
//! interval by [`RankingRefresher`] and read by the dispatcher through
//! [`NodeRegistry::candidates`], so a dispatch cycle never scores nodes itself.

pub mod node;
pub mod scoring;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::context::GridContext;
use crate::error::{GridError, Result};
use crate::scheduler::job::field;
use crate::shutdown::sleep_or_cancel;
use crate::store::{keys, with_retry, CoordinationStore};

pub use node::{Node, NodeCapabilities, NodeRegistration, NodeStats, NodeStatus};
pub use scoring::compute_score;

/// A node and the score it was ranked with.
#[derive(Debug, Clone)]
pub struct RankedNode {
    pub node: Node,
    pub score: f64,
}

#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<dyn CoordinationStore>,
    lease_ttl: Duration,
    top_k: usize,
}

impl NodeRegistry {
    pub fn new(ctx: &GridContext) -> Self {
        Self {
            store: ctx.store.clone(),
            lease_ttl: ctx.config.registry.lease_ttl,
            top_k: ctx.config.dispatch.top_k,
        }
    }

    /// Register or re-register a node. Counters of an existing record survive.
    pub async fn register(&self, registration: NodeRegistration) -> Result<Node> {
        registration.validate()?;
        let key = keys::node(&registration.node_id);

        let created = self
            .store
            .hash_create(&key, &Node::initial_fields(&registration)?)
            .await?;
        if !created {
            let mut fields = Node::descriptive_fields(&registration)?;
            fields.push(field("last_heartbeat", Utc::now().to_rfc3339()));
            self.store.hash_set(&key, &fields).await?;
        }

        self.refresh_lease(&registration.node_id).await?;
        self.store
            .zset_add(&keys::region_nodes(&registration.region), &registration.node_id, 0.0)
            .await?;
        self.store.zset_add(keys::REGIONS, &registration.region, 0.0).await?;

        tracing::info!(
            node_id = %registration.node_id,
            region = %registration.region,
            max_concurrency = registration.capabilities.max_concurrency,
            reregistered = !created,
            "Node registered"
        );
        self.load(&registration.node_id).await
    }

    /// Refresh a node's lease and health metrics.
    pub async fn heartbeat(&self, node_id: &str, stats: NodeStats) -> Result<Node> {
        let mut node = self.load(node_id).await?;
        node.stats = stats;
        if node.status == NodeStatus::Offline {
            node.status = NodeStatus::Online;
        }
        let status = node.derived_status();

        let mut fields = node.stats.to_fields();
        fields.push(field("status", status.as_str()));
        fields.push(field("last_heartbeat", Utc::now().to_rfc3339()));
        self.store.hash_set(&keys::node(node_id), &fields).await?;
        self.refresh_lease(node_id).await?;

        tracing::debug!(node_id, status = %status, load = node.current_load, "Heartbeat");
        node.status = status;
        Ok(node)
    }

    /// Graceful sign-off. The node stops being a candidate immediately.
    pub async fn deregister(&self, node_id: &str) -> Result<()> {
        self.load(node_id).await?;
        self.store
            .hash_set(
                &keys::node(node_id),
                &[field("status", NodeStatus::Offline.as_str())],
            )
            .await?;
        self.store.delete(&keys::node_lease(node_id)).await?;
        tracing::info!(node_id, "Node deregistered");
        Ok(())
    }

    async fn refresh_lease(&self, node_id: &str) -> Result<()> {
        self.store
            .set(&keys::node_lease(node_id), "1", Some(self.lease_ttl))
            .await
    }

    pub async fn is_live(&self, node_id: &str) -> Result<bool> {
        Ok(self.store.get(&keys::node_lease(node_id)).await?.is_some())
    }

    pub async fn get_node(&self, node_id: &str) -> Result<Option<Node>> {
        let fields = self.store.hash_get_all(&keys::node(node_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Node::from_fields(&fields).map(Some)
    }

    async fn load(&self, node_id: &str) -> Result<Node> {
        self.get_node(node_id)
            .await?
            .ok_or_else(|| GridError::NodeNotFound(node_id.to_string()))
    }

    /// Every node ever registered in a region, live or not.
    pub async fn nodes_in_region(&self, region: &str) -> Result<Vec<Node>> {
        let ids = self.store.zset_range(&keys::region_nodes(region), 0, -1).await?;
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_node(&id).await {
                Ok(Some(node)) => nodes.push(node),
                Ok(None) => {}
                Err(e) => tracing::warn!(node_id = %id, error = %e, "Skipping unreadable node record"),
            }
        }
        Ok(nodes)
    }

    /// Known regions, in name order.
    pub async fn regions(&self) -> Result<Vec<String>> {
        self.store.zset_range(keys::REGIONS, 0, -1).await
    }

    /// Change the in-flight count by `delta`, never going below zero.
    pub async fn adjust_load(&self, node_id: &str, delta: i64) -> Result<u32> {
        let key = keys::node(node_id);
        let load = self.store.hash_incr(&key, "current_load", delta).await?;
        if load < 0 {
            self.store.hash_set(&key, &[field("current_load", "0")]).await?;
            return Ok(0);
        }
        Ok(load.min(u32::MAX as i64) as u32)
    }

    /// Bump outcome counters after a job reaches a terminal state.
    pub async fn record_outcome(&self, node_id: &str, success: bool, reward: Option<f64>) -> Result<()> {
        let key = keys::node(node_id);
        if success {
            self.store.hash_incr(&key, "completed_jobs", 1).await?;
        } else {
            self.store.hash_incr(&key, "failed_jobs", 1).await?;
        }
        if let Some(amount) = reward {
            self.store.hash_incr_float(&key, "total_rewards", amount).await?;
        }
        Ok(())
    }

    /// Score live nodes with spare concurrency, best first, ties by node id.
    pub async fn rank(&self, region: &str) -> Result<Vec<RankedNode>> {
        let mut eligible = Vec::new();
        for node in self.nodes_in_region(region).await? {
            if node.status == NodeStatus::Offline || !node.has_spare_concurrency() {
                continue;
            }
            if !self.is_live(&node.node_id).await? {
                continue;
            }
            eligible.push(node);
        }

        let max_capacity = eligible.iter().map(|n| n.capacity).fold(0.0, f64::max);
        let mut ranked: Vec<RankedNode> = eligible
            .into_iter()
            .map(|node| {
                let score = compute_score(&node, max_capacity);
                RankedNode { node, score }
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.node.node_id.cmp(&b.node.node_id))
        });
        ranked.truncate(self.top_k);
        Ok(ranked)
    }

    /// Recompute and store the ranking of one region.
    pub async fn refresh_region(&self, region: &str) -> Result<Vec<String>> {
        let ranked = self.rank(region).await?;
        let key = keys::ranking(region);
        // Upsert first and trim after, so readers never see an empty ranking
        // while a refresh is in progress.
        for entry in &ranked {
            // Negated so the best node sorts first and equal scores fall back to id order.
            self.store.zset_add(&key, &entry.node.node_id, -entry.score).await?;
            self.store
                .hash_set(
                    &keys::node(&entry.node.node_id),
                    &[field("score", entry.score.to_string())],
                )
                .await?;
        }
        let current: HashSet<&str> = ranked.iter().map(|r| r.node.node_id.as_str()).collect();
        for stale in self.store.zset_range(&key, 0, -1).await? {
            if !current.contains(stale.as_str()) {
                self.store.zset_remove(&key, &stale).await?;
            }
        }
        if ranked.is_empty() {
            tracing::warn!(region, "No live nodes available in region");
        }
        Ok(ranked.into_iter().map(|r| r.node.node_id).collect())
    }

    /// Recompute rankings for every known region. Returns the number of regions.
    pub async fn refresh_rankings(&self) -> Result<usize> {
        let regions = self.regions().await?;
        for region in &regions {
            self.refresh_region(region).await?;
        }
        Ok(regions.len())
    }

    /// Dispatch candidates from the last ranking pass, computing one if the
    /// region has never been ranked.
    pub async fn candidates(&self, region: &str) -> Result<Vec<String>> {
        let top = self.top_k.max(1) as isize;
        let stored = self.store.zset_range(&keys::ranking(region), 0, top - 1).await?;
        if !stored.is_empty() {
            return Ok(stored);
        }
        self.refresh_region(region).await
    }
}

/// Background loop recomputing rankings on a fixed interval.
pub struct RankingRefresher {
    registry: NodeRegistry,
    interval: Duration,
    ctx: GridContext,
}

impl RankingRefresher {
    pub fn new(ctx: GridContext) -> Self {
        Self {
            registry: NodeRegistry::new(&ctx),
            interval: ctx.config.registry.ranking_interval,
            ctx,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Ranking refresher started");
        loop {
            let outcome = with_retry(&self.ctx.config.retry, "refresh_rankings", || {
                self.registry.refresh_rankings()
            })
            .await;
            match outcome {
                Ok(regions) => tracing::debug!(regions, "Rankings refreshed"),
                Err(e) => tracing::error!(error = %e, "Ranking refresh failed"),
            }
            if !sleep_or_cancel(self.interval, &cancel).await {
                break;
            }
        }
        tracing::info!("Ranking refresher stopped");
    }
}
