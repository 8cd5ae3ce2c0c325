use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::context::GridContext;
use crate::error::GridError;
use crate::registry::{NodeRegistration, NodeRegistry};
use crate::worker::executor::ExecutorStats;

/// Keeps a node's registration and lease alive.
///
/// Registers on start, heartbeats every interval with the executor's
/// current stats, and signs off when cancelled.
pub struct HeartbeatSender {
    registry: NodeRegistry,
    registration: NodeRegistration,
    stats: Arc<ExecutorStats>,
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(ctx: &GridContext, registration: NodeRegistration, stats: Arc<ExecutorStats>) -> Self {
        Self {
            registry: NodeRegistry::new(ctx),
            registration,
            stats,
            interval: ctx.config.registry.heartbeat_interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let node_id = self.registration.node_id.clone();
        let mut registered = self.register().await;
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if !registered {
                registered = self.register().await;
                continue;
            }

            let stats = self
                .stats
                .snapshot(self.registration.capabilities.max_concurrency);
            match self.registry.heartbeat(&node_id, stats).await {
                Ok(_) => {}
                Err(GridError::NodeNotFound(_)) => {
                    tracing::warn!(node_id = %node_id, "Node record missing, re-registering");
                    registered = self.register().await;
                }
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Heartbeat failed");
                }
            }
        }

        if let Err(e) = self.registry.deregister(&node_id).await {
            tracing::warn!(node_id = %node_id, error = %e, "Deregistration failed");
        }
    }

    async fn register(&self) -> bool {
        let mut registration = self.registration.clone();
        registration.stats = self
            .stats
            .snapshot(registration.capabilities.max_concurrency);
        match self.registry.register(registration).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(node_id = %self.registration.node_id, error = %e, "Registration failed");
                false
            }
        }
    }
}
