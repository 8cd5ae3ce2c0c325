
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use synapse_dispatch::aggregator::{
    DistributionReport, Reward, RewardDistributor, RewardStatus, ResultAggregator, ResultOutcome,
};
use synapse_dispatch::collaborators::SettlementQueue;
use synapse_dispatch::context::GridContext;
use synapse_dispatch::error::{GridError, Result};
use synapse_dispatch::scheduler::{Job, JobStatus, JobSubmission};
use synapse_dispatch::store::{keys, CoordinationStore};
use synapse_dispatch::worker::JobResult;
use test_harness::{assert_eventually, test_config, TestGrid};

/// Submit `job_id` and assign it to a fresh node `N1`.
async fn assigned_job(grid: &TestGrid, job_id: &str, priority: i32) {
    grid.register("N1", "r1").await;
    grid.submit(job_id, "r1", priority).await;
    let report = grid.dispatcher("r1").dispatch_cycle().await.unwrap();
    assert_eq!(report.assigned, 1);
}

#[tokio::test]
async fn test_failure_result_fails_job_without_reward() {
    let grid = TestGrid::new();
    assigned_job(&grid, "J1", 3).await;
    grid.queue.mark_running("J1", "N1").await.unwrap();

    let outcome = grid
        .aggregator()
        .handle_result(JobResult::failure("J1", "N1", "CUDA out of memory", 40))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ResultOutcome::Failed {
            error: "CUDA out of memory".into()
        }
    );

    let job = grid.job("J1").await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("CUDA out of memory"));
    assert!(job.completed_at.is_some());
    assert_eq!(grid.reward_count(&["J1"]).await, 0);

    let node = grid.node("N1").await;
    assert_eq!(node.failed_jobs, 1);
    assert_eq!(node.completed_jobs, 0);
    assert_eq!(node.current_load, 0);
    assert!(grid.queue.active_jobs(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_success_without_output_counts_as_failure() {
    let grid = TestGrid::new();
    assigned_job(&grid, "J1", 1).await;

    let result = JobResult::success("J1", "N1", Value::Null, 5);
    let outcome = grid.aggregator().handle_result(result).await.unwrap();
    assert_eq!(
        outcome,
        ResultOutcome::Failed {
            error: "missing output".into()
        }
    );
    assert_eq!(grid.status("J1").await, JobStatus::Failed);
    assert_eq!(grid.reward_count(&["J1"]).await, 0);
}

#[tokio::test]
async fn test_result_before_start_completes_assigned_job() {
    let grid = TestGrid::new();
    assigned_job(&grid, "J1", 1).await;

    let outcome = grid
        .aggregator()
        .handle_result(JobResult::success("J1", "N1", json!({"ok": true}), 1))
        .await
        .unwrap();
    assert!(matches!(outcome, ResultOutcome::Completed { .. }));
    assert_eq!(grid.status("J1").await, JobStatus::Completed);
}

#[tokio::test]
async fn test_unknown_job_and_stale_node_are_discarded() {
    let grid = TestGrid::new();
    assigned_job(&grid, "J1", 1).await;
    let aggregator = grid.aggregator();

    let outcome = aggregator
        .handle_result(JobResult::success("nope", "N1", json!(1), 1))
        .await
        .unwrap();
    assert_eq!(outcome, ResultOutcome::UnknownJob);

    let outcome = aggregator
        .handle_result(JobResult::success("J1", "N9", json!(1), 1))
        .await
        .unwrap();
    assert_eq!(outcome, ResultOutcome::StaleNode);
    assert_eq!(grid.status("J1").await, JobStatus::Assigned);
    assert_eq!(grid.node("N1").await.current_load, 1);
}

#[tokio::test]
async fn test_failed_job_is_not_completed_by_late_success() {
    let grid = TestGrid::new();
    assigned_job(&grid, "J1", 1).await;
    let aggregator = grid.aggregator();

    aggregator
        .handle_result(JobResult::failure("J1", "N1", "boom", 1))
        .await
        .unwrap();
    let outcome = aggregator
        .handle_result(JobResult::success("J1", "N1", json!({"v": 1}), 1))
        .await
        .unwrap();
    assert_eq!(outcome, ResultOutcome::Duplicate);
    assert_eq!(grid.status("J1").await, JobStatus::Failed);
    assert_eq!(grid.reward_count(&["J1"]).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redelivery_creates_one_reward() {
    let grid = TestGrid::new();
    assigned_job(&grid, "J1", 2).await;
    grid.queue.mark_running("J1", "N1").await.unwrap();

    let aggregator = Arc::new(grid.aggregator());
    let result = JobResult::success("J1", "N1", json!({"v": 1}), 8);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let aggregator = aggregator.clone();
        let result = result.clone();
        handles.push(tokio::spawn(async move {
            aggregator.handle_result(result).await.unwrap()
        }));
    }

    let mut completed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            ResultOutcome::Completed { .. } => completed += 1,
            ResultOutcome::Duplicate => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(completed, 1);
    assert_eq!(grid.reward_count(&["J1"]).await, 1);

    let node = grid.node("N1").await;
    assert_eq!(node.completed_jobs, 1);
    assert!((node.total_rewards - 0.02).abs() < 1e-9);
}

#[tokio::test]
async fn test_redelivery_repairs_missing_reward() {
    let grid = TestGrid::new();
    assigned_job(&grid, "J1", 1).await;
    // Terminal swap applied but the first pass stopped before the reward.
    grid.queue
        .complete("J1", "N1", JobStatus::Completed, Some(&json!({"v": 1})), None)
        .await
        .unwrap();

    let outcome = grid
        .aggregator()
        .handle_result(JobResult::success("J1", "N1", json!({"v": 1}), 1))
        .await
        .unwrap();
    assert_eq!(outcome, ResultOutcome::Duplicate);
    assert_eq!(grid.reward_count(&["J1"]).await, 1);

    let node = grid.node("N1").await;
    assert_eq!(node.completed_jobs, 1);
    assert_eq!(node.current_load, 0);
    assert!(grid.queue.active_jobs(10).await.unwrap().is_empty());

    // N1 takes work again once its executor drops the old claim.
    grid.store.delete(&keys::node_lock("N1")).await.unwrap();
    grid.submit("J2", "r1", 1).await;
    let report = grid.dispatcher("r1").dispatch_cycle().await.unwrap();
    assert_eq!(report.assigned, 1);
    assert_eq!(grid.job("J2").await.assigned_node.as_deref(), Some("N1"));
}

#[tokio::test]
async fn test_interrupted_pass_releases_node_on_redelivery() {
    let grid = TestGrid::new();
    assigned_job(&grid, "J1", 1).await;
    let aggregator = grid.aggregator();
    let result = JobResult::success("J1", "N1", json!({"v": 1}), 1);

    grid.faults.fail_next("zset_remove", keys::ACTIVE_JOBS);
    assert!(aggregator.handle_result(result.clone()).await.is_err());
    assert_eq!(grid.status("J1").await, JobStatus::Completed);
    assert_eq!(grid.node("N1").await.current_load, 1);

    for _ in 0..2 {
        let outcome = aggregator.handle_result(result.clone()).await.unwrap();
        assert_eq!(outcome, ResultOutcome::Duplicate);
    }

    let node = grid.node("N1").await;
    assert_eq!(node.current_load, 0);
    assert_eq!(node.completed_jobs, 1);
    assert!((node.total_rewards - 0.01).abs() < 1e-9);
    assert!(grid.queue.active_jobs(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_interrupted_failure_pass_counts_failure_once() {
    let grid = TestGrid::new();
    assigned_job(&grid, "J1", 1).await;
    let aggregator = grid.aggregator();
    let result = JobResult::failure("J1", "N1", "boom", 1);

    grid.faults.fail_next("zset_remove", keys::ACTIVE_JOBS);
    assert!(aggregator.handle_result(result.clone()).await.is_err());

    for _ in 0..2 {
        let outcome = aggregator.handle_result(result.clone()).await.unwrap();
        assert_eq!(outcome, ResultOutcome::Duplicate);
    }
    let node = grid.node("N1").await;
    assert_eq!(node.failed_jobs, 1);
    assert_eq!(node.current_load, 0);
}

#[tokio::test]
async fn test_reward_left_unindexed_is_repaired_and_credited_once() {
    let grid = TestGrid::new();
    assigned_job(&grid, "J1", 3).await;
    let aggregator = grid.aggregator();
    let result = JobResult::success("J1", "N1", json!({"v": 1}), 1);

    // The record is written but the pass dies before indexing it.
    grid.faults.fail_next("zset_add", keys::PENDING_REWARDS);
    assert!(aggregator.handle_result(result.clone()).await.is_err());
    assert_eq!(grid.reward_count(&["J1"]).await, 1);
    assert!(grid.ledger().pending(10).await.unwrap().is_empty());
    assert_eq!(grid.node("N1").await.completed_jobs, 0);

    for _ in 0..3 {
        let outcome = aggregator.handle_result(result.clone()).await.unwrap();
        assert_eq!(outcome, ResultOutcome::Duplicate);
    }
    assert_eq!(grid.ledger().pending(10).await.unwrap(), vec!["J1"]);

    let node = grid.node("N1").await;
    assert_eq!(node.completed_jobs, 1);
    assert!((node.total_rewards - 0.03).abs() < 1e-9);
    assert_eq!(node.current_load, 0);

    let report = RewardDistributor::new(&grid.ctx).distribute_pending().await.unwrap();
    assert_eq!(report.distributed, 1);
}

#[tokio::test]
async fn test_client_is_notified() {
    let grid = TestGrid::new();
    assigned_job(&grid, "J1", 1).await;
    let mut events = grid
        .store
        .subscribe(&keys::client_events("client-1"))
        .await
        .unwrap();

    grid.aggregator()
        .handle_result(JobResult::success("J1", "N1", json!({"v": 1}), 1))
        .await
        .unwrap();

    let event: Value = serde_json::from_str(&events.next().await.unwrap()).unwrap();
    assert_eq!(event["kind"], "completed");
    assert_eq!(event["status"], "COMPLETED");
    assert_eq!(event["result"]["v"], 1);
}

#[tokio::test]
async fn test_aggregator_loop_skips_malformed_payloads() {
    let grid = TestGrid::new();
    assigned_job(&grid, "J1", 1).await;

    grid.store.list_push(keys::RESULTS, "not json").await.unwrap();
    let valid = serde_json::to_string(&JobResult::success("J1", "N1", json!({"v": 1}), 3)).unwrap();
    grid.store.list_push(keys::RESULTS, &valid).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(ResultAggregator::new(&grid.ctx).run(cancel.clone()));

    assert_eventually(
        || {
            let grid_ref = &grid;
            async move { grid_ref.status("J1").await == JobStatus::Completed }
        },
        Duration::from_secs(5),
        "job should complete through the results list",
    )
    .await;
    assert_eq!(grid.store.list_len(keys::RESULTS).await.unwrap(), 0);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_distributor_hands_rewards_to_settlement_once() {
    let grid = TestGrid::new();
    assigned_job(&grid, "J1", 4).await;
    grid.aggregator()
        .handle_result(JobResult::success("J1", "N1", json!({"v": 1}), 1))
        .await
        .unwrap();

    let distributor = RewardDistributor::new(&grid.ctx);
    let report = distributor.distribute_pending().await.unwrap();
    assert_eq!(report.distributed, 1);

    let reward = grid.ledger().get("J1").await.unwrap().unwrap();
    assert_eq!(reward.status, RewardStatus::Distributed);
    assert!((reward.amount - 0.04).abs() < 1e-9);

    let settled = grid
        .store
        .list_range(keys::SETTLEMENT_QUEUE, 0, -1)
        .await
        .unwrap();
    assert_eq!(settled.len(), 1);
    let handed: Reward = serde_json::from_str(&settled[0]).unwrap();
    assert_eq!(handed.job_id, "J1");
    assert_eq!(handed.node_id, "N1");

    let report = distributor.distribute_pending().await.unwrap();
    assert_eq!(report.distributed, 0);
    assert_eq!(grid.store.list_len(keys::SETTLEMENT_QUEUE).await.unwrap(), 1);
}

struct RejectingSettlement;

#[async_trait]
impl SettlementQueue for RejectingSettlement {
    async fn enqueue_pending(&self, _reward: &Reward) -> Result<()> {
        Err(GridError::Store("settlement unavailable".into()))
    }
}

#[tokio::test]
async fn test_failed_handoff_keeps_reward_pending() {
    let grid = TestGrid::new();
    assigned_job(&grid, "J1", 1).await;
    grid.aggregator()
        .handle_result(JobResult::success("J1", "N1", json!({"v": 1}), 1))
        .await
        .unwrap();

    let ctx = GridContext::new(grid.store.clone(), test_config())
        .with_settlement(Arc::new(RejectingSettlement));
    let report = RewardDistributor::new(&ctx).distribute_pending().await.unwrap();
    assert_eq!(report.failed, 1);

    let reward = grid.ledger().get("J1").await.unwrap().unwrap();
    assert_eq!(reward.status, RewardStatus::Pending);
    assert_eq!(reward.claimed_at, None);
    assert_eq!(grid.ledger().pending(10).await.unwrap(), vec!["J1"]);
}

fn reward_for(job_id: &str) -> Reward {
    let job = Job::from_submission(JobSubmission::new("client-1", "gpt2", "r1").with_id(job_id));
    Reward::new(&job, "N1", 0.01)
}

async fn age_claim(grid: &TestGrid, job_id: &str) {
    let claimed_at = (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
    grid.store
        .hash_set(
            &keys::reward(job_id),
            &[("claimed_at".to_string(), claimed_at)],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_abandoned_claims_do_not_starve_distribution() {
    let grid = TestGrid::new();
    let ledger = grid.ledger();
    let stuck: Vec<String> = (0..100).map(|i| format!("S{i:03}")).collect();
    for job_id in &stuck {
        ledger.create(&reward_for(job_id)).await.unwrap();
        // Claimed by a distributor that died before marking it distributed.
        assert!(ledger
            .claim(job_id, Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }
    ledger.create(&reward_for("FRESH")).await.unwrap();

    let distributor = RewardDistributor::new(&grid.ctx);
    let report = distributor.distribute_pending().await.unwrap();
    assert_eq!(report.distributed, 1);
    assert_eq!(report.skipped, 100);
    let fresh = ledger.get("FRESH").await.unwrap().unwrap();
    assert_eq!(fresh.status, RewardStatus::Distributed);
    assert!(fresh.distributed_at.is_some());

    // Once the claims expire they are sent after all.
    for job_id in &stuck {
        age_claim(&grid, job_id).await;
    }
    let report = distributor.distribute_pending().await.unwrap();
    assert_eq!(report.distributed, 100);
    assert!(ledger.pending(10).await.unwrap().is_empty());
    assert_eq!(
        grid.store.list_len(keys::SETTLEMENT_QUEUE).await.unwrap(),
        101
    );
}

#[tokio::test]
async fn test_handoff_is_not_repeated_when_unindex_fails() {
    let grid = TestGrid::new();
    let ledger = grid.ledger();
    ledger.create(&reward_for("J1")).await.unwrap();

    // Fails every retry of the post hand-off cleanup.
    for _ in 0..test_config().retry.attempts {
        grid.faults.fail_next("zset_remove", keys::PENDING_REWARDS);
    }
    let distributor = RewardDistributor::new(&grid.ctx);
    let report = distributor.distribute_pending().await.unwrap();
    assert_eq!(grid.faults.armed(), 0);
    assert_eq!(report.distributed, 1);
    // The leftover entry is seen again and dropped, not sent twice.
    assert_eq!(report.skipped, 1);
    assert!(ledger.pending(10).await.unwrap().is_empty());
    assert_eq!(
        ledger.get("J1").await.unwrap().unwrap().status,
        RewardStatus::Distributed
    );

    // A distributed reward is not sent again, however old its claim.
    age_claim(&grid, "J1").await;
    ledger.create(&reward_for("J1")).await.unwrap();
    let report = distributor.distribute_pending().await.unwrap();
    assert_eq!(report, DistributionReport::default());
    assert_eq!(grid.store.list_len(keys::SETTLEMENT_QUEUE).await.unwrap(), 1);
}
