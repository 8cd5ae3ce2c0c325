//! Node scoring used to rank dispatch candidates.
//!
//! Every term is normalized to `0..=1` and weighted; the weights sum to one
//! and the total is scaled to `0..=100`. A capped uptime bonus is added on
//! top so long-running nodes win ties against fresh ones.
//!
//! Capacity is relative: a node's capacity is divided by the largest
//! capacity among the nodes ranked with it, so the biggest node in a region
//! gets the full availability term and the rest a share in proportion.

use crate::registry::node::Node;

pub const CPU_WEIGHT: f64 = 0.25;
pub const MEMORY_WEIGHT: f64 = 0.15;
pub const SUCCESS_WEIGHT: f64 = 0.25;
pub const LATENCY_WEIGHT: f64 = 0.10;
pub const AVAILABILITY_WEIGHT: f64 = 0.25;

pub const MAX_UPTIME_BONUS: f64 = 10.0;
const UPTIME_BONUS_HOURS: f64 = 24.0;

/// Response time at which the latency term drops to one half.
const LATENCY_REFERENCE_MS: f64 = 1000.0;

fn unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// The busier of reported utilization and in-flight jobs over concurrency.
pub fn effective_load(node: &Node) -> f64 {
    let slots = node.capabilities.max_concurrency.max(1) as f64;
    unit(node.stats.load).max(unit(node.current_load as f64 / slots))
}

/// `capacity` over the region's largest capacity, `0` when nothing has any.
pub fn relative_capacity(capacity: f64, region_max: f64) -> f64 {
    if region_max.is_finite() && region_max > 0.0 {
        unit(capacity / region_max)
    } else {
        0.0
    }
}

pub fn compute_score(node: &Node, region_max_capacity: f64) -> f64 {
    let stats = &node.stats;

    let cpu = 1.0 - unit(stats.cpu_usage / 100.0);
    let memory = unit(stats.memory_available / 100.0);
    let success = unit(stats.success_rate);
    let latency = if !stats.avg_response_ms.is_finite() {
        0.0
    } else if stats.avg_response_ms <= 0.0 {
        1.0
    } else {
        LATENCY_REFERENCE_MS / (LATENCY_REFERENCE_MS + stats.avg_response_ms)
    };
    let availability =
        relative_capacity(node.capacity, region_max_capacity) * (1.0 - effective_load(node));

    let weighted = CPU_WEIGHT * cpu
        + MEMORY_WEIGHT * memory
        + SUCCESS_WEIGHT * success
        + LATENCY_WEIGHT * latency
        + AVAILABILITY_WEIGHT * availability;

    let uptime = if stats.uptime_hours.is_finite() {
        stats.uptime_hours.clamp(0.0, UPTIME_BONUS_HOURS)
    } else {
        0.0
    };
    let bonus = uptime / UPTIME_BONUS_HOURS * MAX_UPTIME_BONUS;

    (weighted * 100.0 + bonus).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::node::{NodeCapabilities, NodeStats, NodeStatus};
    use chrono::Utc;

    fn node(stats: NodeStats) -> Node {
        Node {
            node_id: "n1".into(),
            region: "r1".into(),
            capabilities: NodeCapabilities::default(),
            status: NodeStatus::Online,
            current_load: 0,
            capacity: 1.0,
            score: 0.0,
            stats,
            completed_jobs: 0,
            failed_jobs: 0,
            total_rewards: 0.0,
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
        }
    }

    #[test]
    fn idle_perfect_node_scores_one_hundred() {
        assert!((compute_score(&node(NodeStats::default()), 1.0) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn lower_cpu_never_scores_lower() {
        for (low, high) in [(0.0, 10.0), (20.0, 80.0), (99.0, 100.0), (50.0, 150.0)] {
            let a = node(NodeStats { cpu_usage: low, ..NodeStats::default() });
            let b = node(NodeStats { cpu_usage: high, ..NodeStats::default() });
            assert!(compute_score(&a, 1.0) >= compute_score(&b, 1.0));
        }
    }

    #[test]
    fn reported_load_reduces_availability() {
        let idle = node(NodeStats::default());
        let half = node(NodeStats { load: 0.5, ..NodeStats::default() });
        assert!(compute_score(&idle, 1.0) > compute_score(&half, 1.0));
    }

    #[test]
    fn in_flight_jobs_count_as_load() {
        let mut busy = node(NodeStats::default());
        busy.capabilities.max_concurrency = 2;
        busy.current_load = 1;
        assert!((effective_load(&busy) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn larger_capacity_scores_higher() {
        let mut small = node(NodeStats::default());
        small.capacity = 1.0;
        let mut large = node(NodeStats::default());
        large.capacity = 4.0;

        assert!((compute_score(&large, 4.0) - 100.0).abs() < 1e-9);
        let share = compute_score(&small, 4.0);
        let expected = 100.0 - AVAILABILITY_WEIGHT * 100.0 * 0.75;
        assert!((share - expected).abs() < 1e-9, "got {share}");
    }

    #[test]
    fn relative_capacity_bounds() {
        assert_eq!(relative_capacity(2.0, 4.0), 0.5);
        assert_eq!(relative_capacity(4.0, 4.0), 1.0);
        assert_eq!(relative_capacity(0.0, 0.0), 0.0);
        assert_eq!(relative_capacity(1.0, f64::INFINITY), 0.0);
    }

    #[test]
    fn uptime_bonus_is_capped() {
        let day = node(NodeStats { uptime_hours: 24.0, ..NodeStats::default() });
        let week = node(NodeStats { uptime_hours: 168.0, ..NodeStats::default() });
        assert_eq!(compute_score(&day, 1.0), compute_score(&week, 1.0));
        assert!((compute_score(&day, 1.0) - 110.0).abs() < 1e-9);
    }

    #[test]
    fn garbage_metrics_floor_at_zero() {
        let stats = NodeStats {
            cpu_usage: f64::NAN,
            memory_available: -50.0,
            success_rate: f64::NEG_INFINITY,
            avg_response_ms: f64::INFINITY,
            uptime_hours: -3.0,
            load: 2.0,
        };
        let score = compute_score(&node(stats), f64::NAN);
        assert!(score >= 0.0);
        assert!(score.is_finite());
    }
}
