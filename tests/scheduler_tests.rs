
use std::time::Duration;

use serde_json::json;
use tokio_stream::StreamExt;

use synapse_dispatch::error::GridError;
use synapse_dispatch::scheduler::{JobStatus, JobSubmission};
use synapse_dispatch::store::{keys, CoordinationStore};
use test_harness::TestGrid;

#[tokio::test]
async fn test_submit_persists_pending_job() {
    let grid = TestGrid::new();
    let job = grid
        .queue
        .submit(
            JobSubmission::new("client-1", "gpt2", "r1")
                .with_priority(3)
                .with_input(json!({"prompt": "hi"})),
        )
        .await
        .unwrap();

    assert!(job.job_id.starts_with("job_"));
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);

    let stored = grid.job(&job.job_id).await;
    assert_eq!(stored, job);
    assert!(grid.queue.is_queued("r1", &job.job_id).await.unwrap());
    assert_eq!(grid.queue.active_jobs(10).await.unwrap(), vec![job.job_id.clone()]);
    assert_eq!(grid.queue.jobs_in_region("r1").await.unwrap().len(), 1);
    assert!(grid.queue.jobs_in_region("r2").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_job_id_is_rejected() {
    let grid = TestGrid::new();
    grid.submit("J1", "r1", 1).await;

    let err = grid
        .queue
        .submit(JobSubmission::new("client-2", "bert", "r1").with_id("J1"))
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::DuplicateJob(id) if id == "J1"));

    // The first submission is untouched and queued once.
    assert_eq!(grid.job("J1").await.client_id, "client-1");
    assert_eq!(grid.queue.queue_depth("r1").await.unwrap(), 1);
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let grid = TestGrid::new();
    let cases = [
        JobSubmission::new("client-1", "gpt2", ""),
        JobSubmission::new("client 1", "gpt2", "r1"),
        JobSubmission::new("client-1", " ", "r1"),
        JobSubmission::new("client-1", "gpt2", "r1").with_priority(5000),
        JobSubmission::new("client-1", "gpt2", "r1").with_id("a/b"),
    ];
    for submission in cases {
        let err = grid.queue.submit(submission).await.unwrap_err();
        assert!(matches!(err, GridError::Validation(_)), "got {err:?}");
    }
    assert!(grid.queue.active_jobs(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let grid = TestGrid::new();
    let err = grid.queue.get_status("missing").await.unwrap_err();
    assert!(matches!(err, GridError::JobNotFound(_)));
    assert!(grid.queue.get("missing").await.unwrap().is_none());

    let err = grid.queue.cancel("missing").await.unwrap_err();
    assert!(matches!(err, GridError::JobNotFound(_)));
}

#[tokio::test]
async fn test_legacy_queued_status_reads_as_pending() {
    let grid = TestGrid::new();
    grid.register("N1", "r1").await;
    grid.submit("J1", "r1", 1).await;
    grid.set_job_field("J1", "status", "queued").await;

    assert_eq!(grid.status("J1").await, JobStatus::Pending);

    // And it is still dispatchable.
    let report = grid.dispatcher("r1").dispatch_cycle().await.unwrap();
    assert_eq!(report.assigned, 1);
    assert_eq!(grid.status("J1").await, JobStatus::Assigned);
}

#[tokio::test]
async fn test_status_swaps_follow_the_state_machine() {
    let grid = TestGrid::new();
    grid.submit("J1", "r1", 1).await;

    // Not assigned yet.
    assert!(!grid.queue.mark_running("J1", "N1").await.unwrap());
    assert!(!grid
        .queue
        .complete("J1", "N1", JobStatus::Completed, Some(&json!(1)), None)
        .await
        .unwrap());

    assert!(grid.queue.mark_assigned("J1", "N1").await.unwrap());
    assert!(!grid.queue.mark_assigned("J1", "N2").await.unwrap());
    assert!(grid.queue.mark_running("J1", "N1").await.unwrap());
    assert!(!grid.queue.reclaim("J1").await.unwrap());
    assert!(grid
        .queue
        .complete("J1", "N1", JobStatus::Failed, None, Some("boom"))
        .await
        .unwrap());

    // Terminal states never move again.
    assert!(!grid
        .queue
        .complete("J1", "N1", JobStatus::Completed, Some(&json!(1)), None)
        .await
        .unwrap());
    assert!(!grid.queue.expire("J1", "late").await.unwrap());
    assert!(grid.queue.cancel("J1").await.is_err());

    let job = grid.job("J1").await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.assigned_node.as_deref(), Some("N1"));
    assert_eq!(job.error.as_deref(), Some("boom"));
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_previous_assignee_cannot_start_or_finish_reassigned_job() {
    let grid = TestGrid::new();
    grid.submit("J1", "r1", 1).await;
    assert!(grid.queue.mark_assigned("J1", "N1").await.unwrap());
    // N1's claim lapses and the job moves on to N2.
    assert!(grid.queue.reclaim("J1").await.unwrap());
    assert!(grid.queue.mark_assigned("J1", "N2").await.unwrap());

    assert!(!grid.queue.mark_running("J1", "N1").await.unwrap());
    assert!(!grid
        .queue
        .complete("J1", "N1", JobStatus::Completed, Some(&json!(1)), None)
        .await
        .unwrap());
    assert_eq!(grid.status("J1").await, JobStatus::Assigned);

    assert!(grid.queue.mark_running("J1", "N2").await.unwrap());
    assert!(!grid.queue.mark_running("J1", "N2").await.unwrap());
    assert!(grid
        .queue
        .complete("J1", "N2", JobStatus::Completed, Some(&json!(1)), None)
        .await
        .unwrap());
    assert_eq!(grid.job("J1").await.assigned_node.as_deref(), Some("N2"));
}

#[tokio::test]
async fn test_cancel_releases_assigned_node_once() {
    let grid = TestGrid::new();
    grid.register("N1", "r1").await;
    grid.submit("J1", "r1", 1).await;
    grid.dispatcher("r1").dispatch_cycle().await.unwrap();
    assert_eq!(grid.node("N1").await.current_load, 1);

    grid.queue.cancel("J1").await.unwrap();
    assert_eq!(grid.node("N1").await.current_load, 0);

    // A later sweep of the same job changes nothing.
    grid.reclaimer().reclaim_once().await.unwrap();
    let node = grid.node("N1").await;
    assert_eq!(node.current_load, 0);
    assert_eq!(node.failed_jobs, 0);
}

#[tokio::test]
async fn test_cancelled_is_not_a_reportable_outcome() {
    let grid = TestGrid::new();
    grid.submit("J1", "r1", 1).await;
    let err = grid
        .queue
        .complete("J1", "N1", JobStatus::Cancelled, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::Validation(_)));
}

#[tokio::test]
async fn test_requeue_goes_behind_equal_priority() {
    let grid = TestGrid::new();
    grid.submit("a", "r1", 1).await;
    grid.submit("b", "r1", 1).await;

    let popped = grid.queue.pop_batch("r1", 1, Duration::ZERO).await.unwrap();
    assert_eq!(popped[0].job_id, "a");
    grid.queue.requeue(&grid.job("a").await).await.unwrap();

    let order: Vec<String> = grid
        .queue
        .pop_batch("r1", 2, Duration::ZERO)
        .await
        .unwrap()
        .into_iter()
        .map(|q| q.job_id)
        .collect();
    assert_eq!(order, vec!["b", "a"]);
}

#[tokio::test]
async fn test_cancel_notifies_client() {
    let grid = TestGrid::new();
    grid.submit("J1", "r1", 1).await;
    let mut events = grid
        .store
        .subscribe(&keys::client_events("client-1"))
        .await
        .unwrap();

    grid.queue.cancel("J1").await.unwrap();

    let event: serde_json::Value = serde_json::from_str(&events.next().await.unwrap()).unwrap();
    assert_eq!(event["kind"], "cancelled");
    assert_eq!(event["status"], "CANCELLED");
    assert!(grid.queue.active_jobs(10).await.unwrap().is_empty());
}
