//! Durable task queue.
//!
//! At-least-once: a task stays in the table until it completes or fails for
//! good, and the worker that claims it may die mid-flight. Enqueue coalesces
//! on `(action, target_type, target_id, direction)` against the one pending
//! row the partial unique index allows per key; rows already `processing`
//! are never touched by an enqueue.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::config::QueueConfig;
use crate::error::Result;

use super::state::now_ts;

/// Lower runs sooner.
pub mod priority {
    pub const SYSTEM: i64 = 1;
    pub const FOLDER: i64 = 10;
    pub const FILE: i64 = 20;
    pub const DELETE: i64 = 25;
}

macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $s),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($s => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(Action {
    Create => "create",
    Rename => "rename",
    Delete => "delete",
    Move => "move",
    Update => "update",
    FullSync => "full_sync",
});

str_enum!(TargetType {
    Folder => "folder",
    File => "file",
    System => "system",
});

str_enum!(Direction {
    LocalToRemote => "local_to_remote",
    RemoteToLocal => "remote_to_local",
});

str_enum!(Status {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub action: Action,
    pub target_type: TargetType,
    pub target_id: String,
    pub direction: Direction,
    pub payload: Value,
    pub priority: i64,
    pub status: Status,
    pub attempts: u32,
    pub error: Option<String>,
    pub worker_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    /// `None` when the row names an action, target or direction this build
    /// does not know.
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Option<Self> {
        let payload: String = row.get("payload");
        Some(Self {
            id: row.get("id"),
            action: Action::parse(row.get("action"))?,
            target_type: TargetType::parse(row.get("target_type"))?,
            target_id: row.get("target_id"),
            direction: Direction::parse(row.get("direction"))?,
            payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            priority: row.get("priority"),
            status: Status::parse(row.get("status"))?,
            attempts: row.get::<i64, _>("attempts") as u32,
            error: row.get("error"),
            worker_id: row.get("worker_id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} {} ({})",
            self.id, self.action, self.target_type, self.target_id, self.direction
        )
    }
}

/// A task to enqueue.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub action: Action,
    pub target_type: TargetType,
    pub target_id: String,
    pub direction: Direction,
    pub payload: Value,
    pub priority: i64,
    pub worker_id: i64,
}

impl NewTask {
    pub fn new(
        action: Action,
        target_type: TargetType,
        target_id: impl Into<String>,
        direction: Direction,
        payload: Value,
    ) -> Self {
        let priority = match (action, target_type) {
            (_, TargetType::System) => priority::SYSTEM,
            (Action::Delete, _) => priority::DELETE,
            (_, TargetType::Folder) => priority::FOLDER,
            (_, TargetType::File) => priority::FILE,
        };
        Self {
            action,
            target_type,
            target_id: target_id.into(),
            direction,
            payload,
            priority,
            worker_id: 0,
        }
    }
}

/// What `mark_retry` did with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back to pending.
    Requeued,
    /// A newer pending row for the same key carries the latest payload;
    /// this one was closed as completed.
    Superseded,
    /// The attempt budget is spent; the caller should mark it failed.
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

const SAME_KEY_PENDING: &str = r#"EXISTS (
    SELECT 1 FROM tasks AS p
    WHERE p.status = 'pending'
      AND p.id <> tasks.id
      AND p.action = tasks.action
      AND p.target_type = tasks.target_type
      AND p.target_id = tasks.target_id
      AND p.direction = tasks.direction
)"#;

#[derive(Clone)]
pub struct TaskQueue {
    pool: SqlitePool,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Insert a pending task, or coalesce into the existing pending row for
    /// the same key (new payload and priority, attempts reset). One atomic
    /// statement either way.
    pub async fn enqueue(&self, task: &NewTask) -> Result<i64> {
        let now = now_ts();
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO tasks (
                action, target_type, target_id, direction, payload, priority,
                status, attempts, worker_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?)
            ON CONFLICT(action, target_type, target_id, direction) WHERE status = 'pending'
            DO UPDATE SET
                payload = excluded.payload,
                priority = excluded.priority,
                worker_id = excluded.worker_id,
                attempts = 0,
                error = NULL,
                updated_at = excluded.updated_at
            RETURNING id"#,
        )
        .bind(task.action.as_str())
        .bind(task.target_type.as_str())
        .bind(&task.target_id)
        .bind(task.direction.as_str())
        .bind(task.payload.to_string())
        .bind(task.priority)
        .bind(task.worker_id)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            task_id = id,
            action = %task.action,
            target = %task.target_type,
            target_id = %task.target_id,
            direction = %task.direction,
            "task enqueued"
        );
        Ok(id)
    }

    /// Up to `limit` runnable tasks for `worker_id`, soonest first.
    pub async fn dequeue(&self, limit: u32, worker_id: i64) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            r#"SELECT * FROM tasks
            WHERE status = 'pending'
              AND attempts < ?
              AND (worker_id = 0 OR worker_id = ?)
            ORDER BY priority ASC, created_at ASC, id ASC
            LIMIT ?"#,
        )
        .bind(self.config.max_retries as i64)
        .bind(worker_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            match Task::from_row(row) {
                Some(task) => tasks.push(task),
                None => {
                    let id: i64 = row.get("id");
                    tracing::warn!(task_id = id, "unrecognized task row, failing it");
                    self.mark_failed(id, "unknown task kind").await?;
                }
            }
        }
        Ok(tasks)
    }

    /// Claim a task. False when another worker got there first.
    pub async fn mark_processing(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE tasks
            SET status = 'processing', attempts = attempts + 1, updated_at = ?
            WHERE id = ? AND status = 'pending'"#,
        )
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_completed(&self, id: i64, note: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = 'completed', error = ?, updated_at = ? WHERE id = ?")
            .bind(note)
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = 'failed', error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_retry(&self, id: i64, error: &str) -> Result<RetryOutcome> {
        let mut tx = self.pool.begin().await?;

        let attempts: Option<i64> = sqlx::query_scalar("SELECT attempts FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(attempts) = attempts else {
            return Ok(RetryOutcome::Exhausted);
        };
        if attempts >= self.config.max_retries as i64 {
            return Ok(RetryOutcome::Exhausted);
        }

        let now = now_ts();
        let superseded = sqlx::query(&format!(
            "UPDATE tasks SET status = 'completed', error = 'superseded: ' || ?, updated_at = ? \
             WHERE id = ? AND {SAME_KEY_PENDING}"
        ))
        .bind(error)
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !superseded {
            sqlx::query("UPDATE tasks SET status = 'pending', error = ?, updated_at = ? WHERE id = ?")
                .bind(error)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(if superseded {
            RetryOutcome::Superseded
        } else {
            RetryOutcome::Requeued
        })
    }

    /// Return every failed task to pending with a fresh attempt budget.
    pub async fn reset_failed(&self) -> Result<u64> {
        self.revive("failed", "attempts = 0, error = NULL").await
    }

    /// Tasks left `processing` by a process that died are pending again.
    pub async fn recover_stale(&self) -> Result<u64> {
        self.revive("processing", "error = 'recovered after restart'")
            .await
    }

    /// Move rows in `from` back to pending. A row whose key already has a
    /// pending twin is closed as superseded instead.
    async fn revive(&self, from: &str, set: &str) -> Result<u64> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "UPDATE tasks SET status = 'completed', error = 'superseded', updated_at = ?1 \
             WHERE status = ?2 AND {SAME_KEY_PENDING}"
        ))
        .bind(&now)
        .bind(from)
        .execute(&mut *tx)
        .await?;

        let revived = sqlx::query(&format!(
            "UPDATE OR IGNORE tasks SET status = 'pending', {set}, updated_at = ?1 WHERE status = ?2"
        ))
        .bind(&now)
        .bind(from)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Duplicates of a key that was just revived.
        sqlx::query(
            "UPDATE tasks SET status = 'completed', error = 'superseded', updated_at = ?1 WHERE status = ?2",
        )
        .bind(&now)
        .bind(from)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        if revived > 0 {
            tracing::info!(count = revived, from, "tasks returned to pending");
        }
        Ok(revived)
    }

    pub async fn purge_completed(&self, older_than: Duration) -> Result<u64> {
        self.purge("completed", older_than).await
    }

    pub async fn purge_failed(&self, older_than: Duration) -> Result<u64> {
        self.purge("failed", older_than).await
    }

    async fn purge(&self, status: &str, older_than: Duration) -> Result<u64> {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| chrono::Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let cutoff = cutoff.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let result = sqlx::query("DELETE FROM tasks WHERE status = ? AND updated_at < ?")
            .bind(status)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get(&self, id: i64) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().and_then(Task::from_row))
    }

    /// All tasks in `status`, in dequeue order.
    pub async fn list(&self, status: Status) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status = ? ORDER BY priority ASC, created_at ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(Task::from_row).collect())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let n: i64 = row.get("n");
            match Status::parse(row.get("status")) {
                Some(Status::Pending) => stats.pending = n,
                Some(Status::Processing) => stats.processing = n,
                Some(Status::Completed) => stats.completed = n,
                Some(Status::Failed) => stats.failed = n,
                None => {}
            }
        }
        Ok(stats)
    }

    pub async fn recent_failures(&self, limit: u32) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status = 'failed' ORDER BY updated_at DESC, id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(Task::from_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::memory_pool;

    async fn queue(max_retries: u32) -> TaskQueue {
        TaskQueue::new(memory_pool().await, QueueConfig { max_retries })
    }

    fn file_create(id: &str, payload: Value) -> NewTask {
        NewTask::new(
            Action::Create,
            TargetType::File,
            id,
            Direction::RemoteToLocal,
            payload,
        )
    }

    #[tokio::test]
    async fn enqueue_coalesces_pending_duplicates() {
        let q = queue(3).await;
        let first = q.enqueue(&file_create("/r/a", json!({"v": 1}))).await.unwrap();
        assert!(q.mark_processing(first).await.unwrap());
        assert_eq!(
            q.mark_retry(first, "boom").await.unwrap(),
            RetryOutcome::Requeued
        );
        assert_eq!(q.get(first).await.unwrap().unwrap().attempts, 1);

        let second = q.enqueue(&file_create("/r/a", json!({"v": 2}))).await.unwrap();
        assert_eq!(first, second);

        let pending = q.list(Status::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, json!({"v": 2}));
        assert_eq!(pending[0].attempts, 0);
        assert!(pending[0].error.is_none());
    }

    #[tokio::test]
    async fn enqueue_never_touches_in_flight_row() {
        let q = queue(3).await;
        let first = q.enqueue(&file_create("/r/a", json!({"v": 1}))).await.unwrap();
        assert!(q.mark_processing(first).await.unwrap());

        let second = q.enqueue(&file_create("/r/a", json!({"v": 2}))).await.unwrap();
        assert_ne!(first, second);
        let in_flight = q.get(first).await.unwrap().unwrap();
        assert_eq!(in_flight.status, Status::Processing);
        assert_eq!(in_flight.payload, json!({"v": 1}));

        // Retrying the stale row yields to the newer one.
        assert_eq!(
            q.mark_retry(first, "network").await.unwrap(),
            RetryOutcome::Superseded
        );
        assert_eq!(q.list(Status::Pending).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dequeue_orders_by_priority_then_age() {
        let q = queue(3).await;
        let del = NewTask::new(
            Action::Delete,
            TargetType::File,
            "/r/x",
            Direction::RemoteToLocal,
            json!({}),
        );
        q.enqueue(&del).await.unwrap();
        q.enqueue(&file_create("/r/f1", json!({}))).await.unwrap();
        let folder = NewTask::new(
            Action::Create,
            TargetType::Folder,
            "/r/d",
            Direction::RemoteToLocal,
            json!({}),
        );
        q.enqueue(&folder).await.unwrap();
        q.enqueue(&file_create("/r/f2", json!({}))).await.unwrap();

        let ids: Vec<String> = q
            .dequeue(10, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.target_id)
            .collect();
        assert_eq!(ids, ["/r/d", "/r/f1", "/r/f2", "/r/x"]);
        assert_eq!(q.dequeue(2, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn dequeue_respects_worker_affinity() {
        let q = queue(3).await;
        let mut pinned = file_create("/r/pinned", json!({}));
        pinned.worker_id = 2;
        q.enqueue(&pinned).await.unwrap();
        q.enqueue(&file_create("/r/any", json!({}))).await.unwrap();

        assert_eq!(q.dequeue(10, 1).await.unwrap().len(), 1);
        assert_eq!(q.dequeue(10, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mark_processing_is_compare_and_swap() {
        let q = queue(3).await;
        let id = q.enqueue(&file_create("/r/a", json!({}))).await.unwrap();
        assert!(q.mark_processing(id).await.unwrap());
        assert!(!q.mark_processing(id).await.unwrap());
    }

    #[tokio::test]
    async fn retries_exhaust_into_failed() {
        let q = queue(3).await;
        let id = q.enqueue(&file_create("/r/a", json!({}))).await.unwrap();

        for _ in 0..2 {
            let batch = q.dequeue(10, 0).await.unwrap();
            assert_eq!(batch.len(), 1);
            assert!(q.mark_processing(id).await.unwrap());
            assert_eq!(q.mark_retry(id, "503").await.unwrap(), RetryOutcome::Requeued);
        }
        assert!(q.mark_processing(id).await.unwrap());
        assert_eq!(q.mark_retry(id, "503").await.unwrap(), RetryOutcome::Exhausted);
        q.mark_failed(id, "503").await.unwrap();

        assert!(q.dequeue(10, 0).await.unwrap().is_empty());
        let failed = q.recent_failures(5).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(failed[0].error.as_deref(), Some("503"));

        assert_eq!(q.reset_failed().await.unwrap(), 1);
        let revived = q.get(id).await.unwrap().unwrap();
        assert_eq!(revived.status, Status::Pending);
        assert_eq!(revived.attempts, 0);
    }

    #[tokio::test]
    async fn stale_processing_rows_recover() {
        let q = queue(3).await;
        let a = q.enqueue(&file_create("/r/a", json!({}))).await.unwrap();
        let b = q.enqueue(&file_create("/r/b", json!({}))).await.unwrap();
        q.mark_processing(a).await.unwrap();
        q.mark_processing(b).await.unwrap();
        // A fresh event for /r/b arrived while it was in flight.
        q.enqueue(&file_create("/r/b", json!({"v": 2}))).await.unwrap();

        assert_eq!(q.recover_stale().await.unwrap(), 1);
        let stats = q.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn purge_drops_only_old_rows_of_that_status() {
        let q = queue(3).await;
        let done = q.enqueue(&file_create("/r/a", json!({}))).await.unwrap();
        q.enqueue(&file_create("/r/b", json!({}))).await.unwrap();
        q.mark_completed(done, None).await.unwrap();

        assert_eq!(q.purge_completed(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(q.purge_completed(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(q.stats().await.unwrap().pending, 1);
    }
}
