use std::sync::Arc;

use crate::collaborators::{AuditLog, SettlementQueue, StoreSettlementQueue, TracingAuditLog};
use crate::config::GridConfig;
use crate::store::CoordinationStore;

/// Everything a grid component needs, built once per process and cloned
/// into each task.
#[derive(Clone)]
pub struct GridContext {
    pub store: Arc<dyn CoordinationStore>,
    pub config: Arc<GridConfig>,
    pub audit: Arc<dyn AuditLog>,
    pub settlement: Arc<dyn SettlementQueue>,
}

impl GridContext {
    /// Context with the tracing audit log and store-backed settlement queue.
    pub fn new(store: Arc<dyn CoordinationStore>, config: GridConfig) -> Self {
        Self {
            settlement: Arc::new(StoreSettlementQueue::new(store.clone())),
            audit: Arc::new(TracingAuditLog),
            config: Arc::new(config),
            store,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_settlement(mut self, settlement: Arc<dyn SettlementQueue>) -> Self {
        self.settlement = settlement;
        self
    }
}

impl std::fmt::Debug for GridContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
