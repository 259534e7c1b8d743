pub mod events;
mod handlers;
pub mod lease;
pub mod payload;
pub mod queue;
pub mod reconciler;
pub mod remote_watcher;
pub mod state;
mod transfer;
pub mod worker;

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::error::Result;
use crate::local::LocalStore;
use crate::remote::RemoteClient;

use handlers::Handlers;
use lease::LeaseManager;
use queue::{Action, Direction, NewTask, QueueStats, TargetType, TaskQueue};
use reconciler::{ChangeEntry, ReconcileReport, Reconciler};
use transfer::TransferEngine;
use worker::{Worker, WorkerOutcome};

/// Target id of the system full-sync task.
pub const FULL_SYNC_TARGET: &str = "root";

/// Host-facing entry points, wired once from the config.
pub struct SyncEngine {
    pool: SqlitePool,
    queue: TaskQueue,
    reconciler: Arc<Reconciler>,
    worker: Worker,
    remote: Arc<dyn RemoteClient>,
    remote_root: String,
}

impl SyncEngine {
    pub fn new(
        pool: SqlitePool,
        config: &Config,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
    ) -> Self {
        let queue = TaskQueue::new(pool.clone(), config.queue());
        let reconciler = Arc::new(Reconciler::new(
            pool.clone(),
            queue.clone(),
            local.clone(),
            remote.clone(),
            config.reconcile(),
        ));
        let transfer = TransferEngine::new(remote.clone(), local.clone(), config.transfer.clone());
        let handlers = Arc::new(Handlers::new(
            pool.clone(),
            local,
            remote.clone(),
            transfer,
            reconciler.clone(),
        ));
        let worker = Worker::new(
            queue.clone(),
            LeaseManager::new(pool.clone(), config.lease()),
            handlers,
            config.worker(),
        );

        Self {
            pool,
            queue,
            reconciler,
            worker,
            remote,
            remote_root: config.remote.root.clone(),
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub async fn cursor(&self) -> Result<Option<state::Cursor>> {
        state::get_cursor(&self.pool, &self.remote_root).await
    }

    /// Pull the change feed from the stored cursor and reconcile it page by
    /// page. The cursor moves only after a page's tasks are enqueued.
    ///
    /// Without a stored cursor the feed starts at "now"; existing remote
    /// content is imported by a full sync instead.
    pub async fn notify_change(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let Some(stored) = self.cursor().await? else {
            let latest = self.remote.latest_cursor(&self.remote_root).await?;
            state::set_cursor(&self.pool, &self.remote_root, &latest, false).await?;
            tracing::info!(root = %self.remote_root, "initialized change cursor");
            return Ok(report);
        };

        let mut cursor = stored.cursor;
        loop {
            let page = self.remote.list_folder_continue(&cursor).await?;
            let entries: Vec<ChangeEntry> =
                page.entries.into_iter().map(ChangeEntry::from).collect();
            if !entries.is_empty() {
                report.absorb(self.reconciler.reconcile(&entries).await?);
            }
            state::set_cursor(&self.pool, &self.remote_root, &page.cursor, page.has_more).await?;
            cursor = page.cursor;
            if !page.has_more {
                break;
            }
        }

        if report.enqueued() > 0 {
            tracing::info!(
                folders = report.folders,
                files = report.files,
                deletions = report.deletions,
                conflicts = report.conflicts,
                "remote changes queued"
            );
        }
        Ok(report)
    }

    /// Reconcile a change-feed payload pushed by the host.
    pub async fn reconcile_changes(&self, entries: &[ChangeEntry]) -> Result<ReconcileReport> {
        self.reconciler.reconcile(entries).await
    }

    pub async fn run_worker(&self, worker_id: i64) -> Result<WorkerOutcome> {
        self.worker.run(worker_id).await
    }

    /// Queue a full enumeration of the remote tree. Repeated calls coalesce
    /// into the one pending task.
    pub async fn start_full_sync(&self) -> Result<i64> {
        let task = NewTask::new(
            Action::FullSync,
            TargetType::System,
            FULL_SYNC_TARGET,
            Direction::RemoteToLocal,
            json!({}),
        );
        let id = self.queue.enqueue(&task).await?;
        tracing::info!(task_id = id, "full sync queued");
        Ok(id)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }
}

/// Parse a pushed change payload: a bare array of entries or an object
/// with an `entries` array.
pub fn parse_changes(payload: &str) -> Result<Vec<ChangeEntry>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Payload {
        Bare(Vec<ChangeEntry>),
        Wrapped { entries: Vec<ChangeEntry> },
    }

    Ok(match serde_json::from_str(payload)? {
        Payload::Bare(entries) | Payload::Wrapped { entries } => entries,
    })
}
