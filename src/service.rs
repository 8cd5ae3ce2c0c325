use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::aggregator::{ResultAggregator, RewardDistributor};
use crate::context::GridContext;
use crate::error::Result;
use crate::reclaimer::Reclaimer;
use crate::registry::{NodeRegistration, NodeRegistry, RankingRefresher};
use crate::scheduler::job::validate_identifier;
use crate::scheduler::{Dispatcher, JobQueue};
use crate::shutdown::sleep_or_cancel;
use crate::worker::{HeartbeatSender, ModelRunner, NodeExecutor};

/// Which background loops this process runs. Every role is safe to run in
/// several processes at once.
#[derive(Debug, Clone, Copy)]
pub struct ServiceRoles {
    pub dispatch: bool,
    pub rankings: bool,
    pub aggregate: bool,
    pub rewards: bool,
    pub reclaim: bool,
}

impl Default for ServiceRoles {
    fn default() -> Self {
        Self {
            dispatch: true,
            rankings: true,
            aggregate: true,
            rewards: true,
            reclaim: true,
        }
    }
}

impl ServiceRoles {
    /// Only the node-side loops of any local nodes.
    pub fn none() -> Self {
        Self {
            dispatch: false,
            rankings: false,
            aggregate: false,
            rewards: false,
            reclaim: false,
        }
    }
}

/// A node hosted inside this process.
pub struct LocalNode {
    pub registration: NodeRegistration,
    pub runner: Arc<dyn ModelRunner>,
}

impl LocalNode {
    pub fn new(registration: NodeRegistration, runner: Arc<dyn ModelRunner>) -> Self {
        Self {
            registration,
            runner,
        }
    }
}

/// Runs the grid's background loops until cancelled.
pub struct GridService {
    ctx: GridContext,
    roles: ServiceRoles,
    nodes: Vec<LocalNode>,
}

impl GridService {
    pub fn new(ctx: GridContext) -> Self {
        Self {
            ctx,
            roles: ServiceRoles::default(),
            nodes: Vec::new(),
        }
    }

    pub fn with_roles(mut self, roles: ServiceRoles) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_local_node(mut self, node: LocalNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn context(&self) -> &GridContext {
        &self.ctx
    }

    /// Ingestion-facing handle: submit, get_status, cancel.
    pub fn queue(&self) -> JobQueue {
        JobQueue::new(&self.ctx)
    }

    /// Start every configured loop and wait for all of them to stop.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        for region in &self.ctx.config.regions {
            validate_identifier("region", region)?;
        }
        for node in &self.nodes {
            node.registration.validate()?;
        }

        let mut tasks = JoinSet::new();
        let ctx = &self.ctx;

        for node in self.nodes {
            let executor = Arc::new(NodeExecutor::new(
                ctx,
                node.registration.node_id.clone(),
                node.runner,
                node.registration.capabilities.max_concurrency,
            ));
            let heartbeat = HeartbeatSender::new(ctx, node.registration, executor.stats());
            tasks.spawn(heartbeat.run(cancel.clone()));
            tasks.spawn(executor.run(cancel.clone()));
        }

        if self.roles.rankings {
            tasks.spawn(RankingRefresher::new(ctx.clone()).run(cancel.clone()));
        }
        if self.roles.dispatch {
            tasks.spawn(supervise_regions(ctx.clone(), cancel.clone()));
        }
        if self.roles.aggregate {
            tasks.spawn(ResultAggregator::new(ctx).run(cancel.clone()));
        }
        if self.roles.rewards {
            tasks.spawn(RewardDistributor::new(ctx).run(cancel.clone()));
        }
        if self.roles.reclaim {
            tasks.spawn(Reclaimer::new(ctx).run(cancel.clone()));
        }

        tracing::info!(tasks = tasks.len(), regions = ?ctx.config.regions, "Grid service started");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Background task panicked");
            }
        }

        tracing::info!("Grid service stopped");
        Ok(())
    }
}

/// Keep one dispatcher running per region, picking up regions as jobs and
/// nodes introduce them.
async fn supervise_regions(ctx: GridContext, cancel: CancellationToken) {
    let registry = NodeRegistry::new(&ctx);
    let spawn_ctx = ctx.clone();
    let spawn_cancel = cancel.clone();
    let mut dispatchers = RegionTasks::new(move |region| {
        tokio::spawn(Dispatcher::new(&spawn_ctx, region).run(spawn_cancel.clone()))
    });

    loop {
        let mut regions = ctx.config.regions.clone();
        match registry.regions().await {
            Ok(known) => regions.extend(known),
            Err(e) => tracing::warn!(error = %e, "Could not list regions"),
        }
        dispatchers.ensure(regions).await;

        if !sleep_or_cancel(ctx.config.dispatch.region_discovery_interval, &cancel).await {
            break;
        }
    }

    dispatchers.shutdown().await;
}

/// One task per region. A task that ends while the service is still running
/// is reaped and started again on the next [`ensure`](Self::ensure).
struct RegionTasks<F> {
    start: F,
    running: HashMap<String, JoinHandle<()>>,
}

impl<F> RegionTasks<F>
where
    F: FnMut(String) -> JoinHandle<()>,
{
    fn new(start: F) -> Self {
        Self {
            start,
            running: HashMap::new(),
        }
    }

    /// Reap finished tasks, then start one for every listed region without one.
    async fn ensure(&mut self, regions: impl IntoIterator<Item = String>) {
        let finished: Vec<String> = self
            .running
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(region, _)| region.clone())
            .collect();
        for region in finished {
            if let Some(handle) = self.running.remove(&region) {
                match handle.await {
                    Ok(()) => tracing::warn!(region = %region, "Dispatcher stopped, restarting"),
                    Err(e) => tracing::error!(region = %region, error = %e, "Dispatcher panicked, restarting"),
                }
            }
        }

        for region in regions {
            if !self.running.contains_key(&region) {
                tracing::info!(region = %region, "Starting dispatcher for region");
                let handle = (self.start)(region.clone());
                self.running.insert(region, handle);
            }
        }
    }

    async fn shutdown(self) {
        for (region, handle) in self.running {
            if let Err(e) = handle.await {
                tracing::error!(region = %region, error = %e, "Dispatcher panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn panicked_region_task_is_restarted() {
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = starts.clone();
        let mut tasks = RegionTasks::new(move |region: String| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if attempt == 0 {
                    panic!("dispatcher for {region} crashed");
                }
                std::future::pending::<()>().await;
            })
        });

        tasks.ensure(vec!["r1".to_string()]).await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        while !tasks.running["r1"].is_finished() {
            tokio::task::yield_now().await;
        }

        tasks.ensure(vec!["r1".to_string()]).await;
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert!(!tasks.running["r1"].is_finished());

        // A live task is left alone.
        tasks.ensure(vec!["r1".to_string()]).await;
        assert_eq!(starts.load(Ordering::SeqCst), 2);

        for handle in tasks.running.values() {
            handle.abort();
        }
    }
}
