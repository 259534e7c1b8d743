//! One drain cycle of a worker: lease, dequeue, dispatch, classify, release.

use std::sync::Arc;
use std::time::Duration;

use crate::config::WorkerConfig;
use crate::error::{ErrorClass, Result, SyncError};

use super::handlers::Handlers;
use super::lease::{LeaseManager, worker_scope};
use super::queue::{Action, RetryOutcome, Task, TaskQueue};

/// What a cycle did and when the caller should run the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOutcome {
    /// False when another worker holds the lease; nothing was touched.
    pub leased: bool,
    pub completed: usize,
    pub failed: usize,
    pub retried: usize,
    pub next_run: Duration,
}

impl WorkerOutcome {
    fn idle(delay: Duration) -> Self {
        Self {
            leased: true,
            completed: 0,
            failed: 0,
            retried: 0,
            next_run: delay,
        }
    }

    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }
}

pub struct Worker {
    queue: TaskQueue,
    leases: LeaseManager,
    handlers: Arc<Handlers>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: TaskQueue,
        leases: LeaseManager,
        handlers: Arc<Handlers>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            leases,
            handlers,
            config,
        }
    }

    /// Run one cycle. Errors only for fatal failures and for queue or lease
    /// bookkeeping that could not be written.
    pub async fn run(&self, worker_id: i64) -> Result<WorkerOutcome> {
        let scope = worker_scope(worker_id);
        if !self.leases.acquire(&scope).await? {
            tracing::debug!(worker_id, scope = %scope, "lease held elsewhere, skipping cycle");
            return Ok(WorkerOutcome {
                leased: false,
                ..WorkerOutcome::idle(self.config.idle_delay)
            });
        }

        let result = self.drain(worker_id).await;

        if let Err(e) = self.leases.release(&scope).await {
            tracing::warn!(worker_id, error = %e, "failed to release lease");
        }
        result
    }

    async fn drain(&self, worker_id: i64) -> Result<WorkerOutcome> {
        let tasks = self
            .queue
            .dequeue(self.config.batch_size, worker_id)
            .await?;

        if tasks.is_empty() {
            match self
                .queue
                .purge_completed(self.config.completed_retention)
                .await
            {
                Ok(0) => {}
                Ok(n) => tracing::debug!(purged = n, "old completed tasks removed"),
                Err(e) => tracing::warn!(error = %e, "purge of completed tasks failed"),
            }
            return Ok(WorkerOutcome::idle(self.config.idle_delay));
        }

        tracing::debug!(worker_id, count = tasks.len(), "draining tasks");
        let mut outcome = WorkerOutcome::idle(Duration::ZERO);
        let mut ran_full_sync = false;

        for task in &tasks {
            if !self.queue.mark_processing(task.id).await? {
                tracing::debug!(task = %task, "claimed by another worker");
                continue;
            }

            match self.handlers.dispatch(task).await {
                Ok(()) => {
                    self.queue.mark_completed(task.id, None).await?;
                    tracing::debug!(task = %task, "task completed");
                    outcome.completed += 1;
                    ran_full_sync |= task.action == Action::FullSync;
                }
                Err(e) => {
                    if self.settle_failure(task, &e, &mut outcome).await? {
                        tracing::error!(task = %task, error = %e, "fatal error, stopping worker cycle");
                        return Err(e);
                    }
                }
            }
        }

        // Tasks that only went back to pending wait for the next idle tick
        // rather than spinning through their attempts.
        if outcome.processed() == 0 && !ran_full_sync {
            outcome.next_run = self.config.idle_delay;
        }
        Ok(outcome)
    }

    /// Record a failed task. Returns true when the cycle must stop.
    async fn settle_failure(
        &self,
        task: &Task,
        err: &SyncError,
        outcome: &mut WorkerOutcome,
    ) -> Result<bool> {
        let message = err.to_string();
        match err.class() {
            ErrorClass::MappingMissing => {
                tracing::info!(task = %task, reason = %message, "target gone, nothing to do");
                self.queue.mark_completed(task.id, Some(&message)).await?;
                outcome.completed += 1;
                Ok(false)
            }
            ErrorClass::Permanent => {
                tracing::error!(task = %task, error = %message, "task failed");
                self.queue.mark_failed(task.id, &message).await?;
                outcome.failed += 1;
                Ok(false)
            }
            ErrorClass::Transient | ErrorClass::Integrity => {
                self.retry(task, &message, outcome).await?;
                Ok(false)
            }
            ErrorClass::Fatal => {
                self.retry(task, &message, outcome).await?;
                Ok(true)
            }
        }
    }

    async fn retry(&self, task: &Task, message: &str, outcome: &mut WorkerOutcome) -> Result<()> {
        match self.queue.mark_retry(task.id, message).await? {
            RetryOutcome::Requeued => {
                tracing::warn!(
                    task = %task,
                    attempt = task.attempts + 1,
                    error = %message,
                    "task will be retried"
                );
                outcome.retried += 1;
            }
            RetryOutcome::Superseded => {
                tracing::debug!(task = %task, "newer task for the same target is pending");
                outcome.completed += 1;
            }
            RetryOutcome::Exhausted => {
                tracing::error!(
                    task = %task,
                    error = %message,
                    "task failed after {} attempts",
                    self.queue.max_retries()
                );
                self.queue.mark_failed(task.id, message).await?;
                outcome.failed += 1;
            }
        }
        Ok(())
    }
}
