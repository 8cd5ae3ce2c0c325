//! Key layout in the coordination store.

/// Sorted set of every region seen by a submission or registration.
pub const REGIONS: &str = "regions";

/// Sorted set of non-terminal job ids, scored by creation time (ms).
pub const ACTIVE_JOBS: &str = "jobs:active";

/// Monotonic counter giving FIFO order within one priority.
pub const QUEUE_SEQUENCE: &str = "jobs:sequence";

/// List of serialized `JobResult`s awaiting aggregation.
pub const RESULTS: &str = "results:queue";

/// Sorted set of reward ids still awaiting distribution.
pub const PENDING_REWARDS: &str = "rewards:pending";

/// List consumed by the external settlement process.
pub const SETTLEMENT_QUEUE: &str = "settlement:pending";

pub fn job(job_id: &str) -> String {
    format!("job:{job_id}")
}

pub fn region_queue(region: &str) -> String {
    format!("queue:{region}")
}

pub fn node(node_id: &str) -> String {
    format!("node:{node_id}")
}

pub fn node_lease(node_id: &str) -> String {
    format!("node:{node_id}:lease")
}

/// Per-node execution list the executor pops assignments from.
pub fn node_jobs(node_id: &str) -> String {
    format!("node:{node_id}:jobs")
}

pub fn node_events(node_id: &str) -> String {
    format!("node:{node_id}:events")
}

pub fn region_nodes(region: &str) -> String {
    format!("nodes:{region}")
}

pub fn ranking(region: &str) -> String {
    format!("ranking:{region}")
}

pub fn node_lock(node_id: &str) -> String {
    format!("lock:node:{node_id}")
}

pub fn reward(job_id: &str) -> String {
    format!("reward:{job_id}")
}

pub fn client_events(client_id: &str) -> String {
    format!("client:{client_id}:events")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_keys_share_a_prefix() {
        assert_eq!(node("n1"), "node:n1");
        assert_eq!(node_lease("n1"), "node:n1:lease");
        assert_eq!(node_jobs("n1"), "node:n1:jobs");
    }

    #[test]
    fn lock_and_reward_keys() {
        assert_eq!(node_lock("n1"), "lock:node:n1");
        assert_eq!(reward("job_1"), "reward:job_1");
        assert_eq!(region_queue("eu-west-1"), "queue:eu-west-1");
    }
}
