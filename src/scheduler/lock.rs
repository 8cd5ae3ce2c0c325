use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::store::{keys, CoordinationStore};

/// Per-node claim that makes an assignment exclusive across dispatchers.
///
/// The lock value is the job id it was taken for, so only the claim's owner
/// can release it. An abandoned claim lapses after its TTL.
#[derive(Clone)]
pub struct AssignmentLock {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
}

impl AssignmentLock {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Claim `node_id` for `job_id`. `false` means someone else holds it.
    pub async fn acquire(&self, node_id: &str, job_id: &str) -> Result<bool> {
        self.store
            .set_if_absent(&keys::node_lock(node_id), job_id, Some(self.ttl))
            .await
    }

    /// Release the claim if it is still held for `job_id`.
    pub async fn release(&self, node_id: &str, job_id: &str) -> Result<bool> {
        self.store
            .delete_if_equals(&keys::node_lock(node_id), job_id)
            .await
    }

    /// Job id currently holding the node, if any.
    pub async fn holder(&self, node_id: &str) -> Result<Option<String>> {
        self.store.get(&keys::node_lock(node_id)).await
    }

    pub async fn is_held_for(&self, node_id: &str, job_id: &str) -> Result<bool> {
        Ok(self.holder(node_id).await?.as_deref() == Some(job_id))
    }
}
