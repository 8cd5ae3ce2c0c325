use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::context::GridContext;
use crate::error::Result;
use crate::registry::NodeStats;
use crate::scheduler::{AssignmentLock, JobQueue};
use crate::shutdown::sleep_or_cancel;
use crate::store::{keys, CoordinationStore};
use crate::worker::report::{JobResult, ResultReporter};
use crate::worker::runner::ModelRunner;

/// Counters a node keeps about its own work, reported with each heartbeat.
#[derive(Debug)]
pub struct ExecutorStats {
    started: Instant,
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU32,
    total_execution_ms: AtomicU64,
}

impl Default for ExecutorStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            in_flight: AtomicU32::new(0),
            total_execution_ms: AtomicU64::new(0),
        }
    }
}

impl ExecutorStats {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    fn job_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    fn job_finished(&self, success: bool, elapsed_ms: u64) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.total_execution_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Health metrics derived from the counters. CPU usage is estimated
    /// from the share of busy slots.
    pub fn snapshot(&self, max_concurrency: u32) -> NodeStats {
        let completed = self.completed();
        let finished = completed + self.failed();
        let load = (self.in_flight() as f64 / max_concurrency.max(1) as f64).min(1.0);
        NodeStats {
            cpu_usage: load * 100.0,
            memory_available: 100.0,
            success_rate: if finished == 0 {
                1.0
            } else {
                completed as f64 / finished as f64
            },
            avg_response_ms: if finished == 0 {
                0.0
            } else {
                self.total_execution_ms.load(Ordering::Relaxed) as f64 / finished as f64
            },
            uptime_hours: self.started.elapsed().as_secs_f64() / 3600.0,
            load,
        }
    }
}

/// Runs the jobs assigned to one node.
///
/// Assignments arrive on the node's execution list. Each one is moved to
/// RUNNING, executed under a timeout, reported on the results list and its
/// node claim released, on success and failure alike.
pub struct NodeExecutor {
    node_id: String,
    store: Arc<dyn CoordinationStore>,
    queue: JobQueue,
    lock: AssignmentLock,
    runner: Arc<dyn ModelRunner>,
    reporter: ResultReporter,
    stats: Arc<ExecutorStats>,
    slots: Arc<Semaphore>,
    execution_timeout: Duration,
    poll_wait: Duration,
    retry: RetryConfig,
}

impl NodeExecutor {
    pub fn new(
        ctx: &GridContext,
        node_id: impl Into<String>,
        runner: Arc<dyn ModelRunner>,
        max_concurrency: u32,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store: ctx.store.clone(),
            queue: JobQueue::new(ctx),
            lock: AssignmentLock::new(ctx.store.clone(), ctx.config.dispatch.lock_ttl),
            runner,
            reporter: ResultReporter::new(ctx.store.clone(), ctx.config.retry.clone()),
            stats: Arc::new(ExecutorStats::default()),
            slots: Arc::new(Semaphore::new(max_concurrency.max(1) as usize)),
            execution_timeout: ctx.config.execution_timeout,
            poll_wait: ctx.config.dispatch.poll_wait,
            retry: ctx.config.retry.clone(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn stats(&self) -> Arc<ExecutorStats> {
        self.stats.clone()
    }

    /// Pull assignments until cancelled, then wait for in-flight jobs.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(node_id = %self.node_id, "Executor started");
        let mut in_flight = JoinSet::new();
        let jobs_key = keys::node_jobs(&self.node_id);

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let popped = tokio::select! {
                _ = cancel.cancelled() => break,
                popped = self.store.list_pop(&jobs_key, self.poll_wait) => popped,
            };

            match popped {
                Ok(Some(job_id)) => {
                    let executor = self.clone();
                    in_flight.spawn(async move {
                        if let Err(e) = executor.handle_assignment(&job_id).await {
                            tracing::error!(job_id = %job_id, node_id = %executor.node_id, error = %e, "Assignment handling failed");
                        }
                        drop(permit);
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(node_id = %self.node_id, error = %e, "Polling assignments failed");
                    if !sleep_or_cancel(self.retry.backoff, &cancel).await {
                        break;
                    }
                }
            }

            // Reap finished tasks so the set does not grow unbounded.
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        tracing::info!(node_id = %self.node_id, "Executor stopped");
    }

    /// Execute one assignment. Returns the reported result, or `None` if the
    /// job was no longer ours to run.
    pub async fn handle_assignment(&self, job_id: &str) -> Result<Option<JobResult>> {
        let Some(job) = self.queue.get(job_id).await? else {
            tracing::warn!(job_id, node_id = %self.node_id, "Assigned job has no record");
            self.lock.release(&self.node_id, job_id).await?;
            return Ok(None);
        };
        if job.assigned_node.as_deref() != Some(self.node_id.as_str()) {
            tracing::info!(job_id, node_id = %self.node_id, "Job was reassigned, skipping");
            self.lock.release(&self.node_id, job_id).await?;
            return Ok(None);
        }
        if !self.queue.mark_running(job_id, &self.node_id).await? {
            tracing::info!(job_id, node_id = %self.node_id, status = %job.status, "Job no longer assigned, skipping");
            self.lock.release(&self.node_id, job_id).await?;
            return Ok(None);
        }

        tracing::info!(job_id, node_id = %self.node_id, model = %job.model_name, "Executing job");
        self.stats.job_started();
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.execution_timeout,
            self.runner.execute(&job.model_name, &job.input_payload),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(output)) => JobResult::success(job_id, &self.node_id, output, elapsed_ms),
            Ok(Err(e)) => JobResult::failure(job_id, &self.node_id, e.to_string(), elapsed_ms),
            Err(_) => JobResult::failure(
                job_id,
                &self.node_id,
                format!(
                    "execution timed out after {}ms",
                    self.execution_timeout.as_millis()
                ),
                elapsed_ms,
            ),
        };
        self.stats.job_finished(result.success, elapsed_ms);

        tracing::info!(
            job_id,
            node_id = %self.node_id,
            success = result.success,
            execution_time_ms = elapsed_ms,
            "Job executed"
        );

        let reported = self.reporter.report(&result).await;
        self.lock.release(&self.node_id, job_id).await?;
        reported?;
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stats_look_healthy() {
        let stats = ExecutorStats::default();
        let snapshot = stats.snapshot(2);
        assert_eq!(snapshot.success_rate, 1.0);
        assert_eq!(snapshot.load, 0.0);
        assert_eq!(snapshot.avg_response_ms, 0.0);
    }

    #[test]
    fn stats_track_outcomes() {
        let stats = ExecutorStats::default();
        stats.job_started();
        stats.job_started();
        assert_eq!(stats.snapshot(4).load, 0.5);

        stats.job_finished(true, 100);
        stats.job_finished(false, 300);
        let snapshot = stats.snapshot(4);
        assert_eq!(stats.completed(), 1);
        assert_eq!(stats.failed(), 1);
        assert_eq!(snapshot.success_rate, 0.5);
        assert_eq!(snapshot.avg_response_ms, 200.0);
        assert_eq!(snapshot.load, 0.0);
    }
}
