use std::time::Duration;

/// Settings for the dispatch engine.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum jobs popped from a region queue per cycle
    pub batch_size: usize,
    /// Number of ranked candidates considered per job
    pub top_k: usize,
    /// TTL of an assignment lock
    pub lock_ttl: Duration,
    /// Bounded wait on an empty region queue
    pub poll_wait: Duration,
    /// Pause after a cycle in which no job could be placed
    pub retry_backoff: Duration,
    /// How often new regions are picked up by the service supervisor
    pub region_discovery_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            top_k: 20,
            lock_ttl: Duration::from_secs(30),
            poll_wait: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(1),
            region_discovery_interval: Duration::from_secs(5),
        }
    }
}

/// Settings for node liveness and ranking.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval at which nodes are expected to heartbeat
    pub heartbeat_interval: Duration,
    /// Lease lifetime; a node that misses heartbeats for this long is stale
    pub lease_ttl: Duration,
    /// How often rankings are recomputed
    pub ranking_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(30),
            ranking_interval: Duration::from_secs(30),
        }
    }
}

/// Settings for the stuck-job reclaimer.
#[derive(Debug, Clone)]
pub struct ReclaimConfig {
    pub interval: Duration,
    /// A pending job older than this that is missing from its queue is requeued
    pub pending_deadline: Duration,
    /// Execution time allowed after the lock TTL before a running job is failed
    pub execution_budget: Duration,
    /// Maximum active jobs inspected per pass
    pub scan_limit: usize,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            pending_deadline: Duration::from_secs(300),
            execution_budget: Duration::from_secs(300),
            scan_limit: 500,
        }
    }
}

/// Settings for reward creation and distribution.
#[derive(Debug, Clone)]
pub struct RewardConfig {
    /// Reward per unit of job priority
    pub base_rate: f64,
    pub distribution_interval: Duration,
    pub batch_size: usize,
    /// A reward claimed this long ago and still PENDING is taken over by
    /// another distributor
    pub claim_timeout: Duration,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            base_rate: 0.01,
            distribution_interval: Duration::from_secs(10),
            batch_size: 100,
            claim_timeout: Duration::from_secs(60),
        }
    }
}

/// Fixed-backoff retry policy for transient store errors.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Regions served from startup. More are discovered as jobs and nodes arrive.
    pub regions: Vec<String>,
    pub dispatch: DispatchConfig,
    pub registry: RegistryConfig,
    pub reclaim: ReclaimConfig,
    pub rewards: RewardConfig,
    pub retry: RetryConfig,
    /// Maximum time a node spends on one job before reporting a timeout
    pub execution_timeout: Duration,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            dispatch: DispatchConfig::default(),
            registry: RegistryConfig::default(),
            reclaim: ReclaimConfig::default(),
            rewards: RewardConfig::default(),
            retry: RetryConfig::default(),
            execution_timeout: Duration::from_secs(300),
        }
    }
}

impl GridConfig {
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.regions.push(region.into());
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.dispatch.lock_ttl = ttl;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.registry.lease_ttl = ttl;
        self
    }

    /// Deadline after assignment at which a running job without a result
    /// is treated as failed.
    pub fn running_deadline(&self) -> Duration {
        self.dispatch.lock_ttl + self.reclaim.execution_budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_config_default() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.top_k, 20);
        assert_eq!(cfg.lock_ttl, Duration::from_secs(30));
        assert_eq!(cfg.poll_wait, Duration::from_secs(1));
    }

    #[test]
    fn registry_config_default() {
        let cfg = RegistryConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(cfg.lease_ttl, Duration::from_secs(30));
        assert_eq!(cfg.ranking_interval, Duration::from_secs(30));
    }

    #[test]
    fn reclaim_config_default() {
        let cfg = ReclaimConfig::default();
        assert_eq!(cfg.pending_deadline, Duration::from_secs(300));
        assert_eq!(cfg.scan_limit, 500);
    }

    #[test]
    fn grid_config_builders() {
        let cfg = GridConfig::default()
            .with_region("eu-west-1")
            .with_region("us-east-1")
            .with_lock_ttl(Duration::from_secs(5))
            .with_lease_ttl(Duration::from_secs(12));
        assert_eq!(cfg.regions, vec!["eu-west-1", "us-east-1"]);
        assert_eq!(cfg.dispatch.lock_ttl, Duration::from_secs(5));
        assert_eq!(cfg.registry.lease_ttl, Duration::from_secs(12));
    }

    #[test]
    fn running_deadline_adds_lock_ttl_and_budget() {
        let cfg = GridConfig::default();
        assert_eq!(cfg.running_deadline(), Duration::from_secs(330));
    }
}
