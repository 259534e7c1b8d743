//! Turns local filesystem callbacks into local-to-remote tasks.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::Notify;

use crate::error::Result;
use crate::local::{LocalId, LocalObserver, LocalStore};
use crate::util::path as sync_path;

use super::payload::LocalPlacement;
use super::queue::{Action, Direction, NewTask, TargetType, TaskQueue};
use super::state;

/// [`LocalObserver`] that records local changes in the task queue.
///
/// Callbacks for entries the engine itself just wrote are dropped: a file
/// whose content matches its stored fingerprint, or a folder that is
/// already mapped, produces no task.
pub struct EventRecorder {
    pool: SqlitePool,
    queue: TaskQueue,
    local: Arc<dyn LocalStore>,
    hidden_prefix: String,
    wake: Option<Arc<Notify>>,
}

impl EventRecorder {
    pub fn new(
        pool: SqlitePool,
        queue: TaskQueue,
        local: Arc<dyn LocalStore>,
        hidden_prefix: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            queue,
            local,
            hidden_prefix: hidden_prefix.into(),
            wake: None,
        }
    }

    /// Notify `wake` after every enqueue so idle workers start early.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    fn hidden(&self, name: &str) -> bool {
        sync_path::is_hidden_name(name, &self.hidden_prefix)
    }

    async fn enqueue(
        &self,
        action: Action,
        target: TargetType,
        id: LocalId,
        payload: serde_json::Value,
    ) -> Result<()> {
        let task = NewTask::new(
            action,
            target,
            id.to_string(),
            Direction::LocalToRemote,
            payload,
        );
        let task_id = self.queue.enqueue(&task).await?;
        tracing::debug!(task_id, local_id = %id, "queued local {action} {target}");
        if let Some(wake) = &self.wake {
            wake.notify_waiters();
        }
        Ok(())
    }

    async fn placed(
        &self,
        action: Action,
        target: TargetType,
        id: LocalId,
        parent: LocalId,
        name: &str,
    ) -> Result<()> {
        let payload = serde_json::to_value(LocalPlacement::new(parent, name))?;
        self.enqueue(action, target, id, payload).await
    }

    async fn folder_created(&self, id: LocalId, parent: LocalId, name: &str) -> Result<()> {
        if self.hidden(name) || state::folder_by_local(&self.pool, id).await?.is_some() {
            return Ok(());
        }
        self.placed(Action::Create, TargetType::Folder, id, parent, name)
            .await
    }

    async fn folder_relocated(
        &self,
        action: Action,
        id: LocalId,
        parent: LocalId,
        name: &str,
    ) -> Result<()> {
        let mapped = state::folder_by_local(&self.pool, id).await?.is_some();
        match (mapped, self.hidden(name)) {
            (true, true) => self.folder_deleted(id).await,
            (false, true) => Ok(()),
            (true, false) => {
                self.placed(action, TargetType::Folder, id, parent, name)
                    .await
            }
            // Never synced: the pending create picks up the new placement.
            (false, false) => {
                self.placed(Action::Create, TargetType::Folder, id, parent, name)
                    .await
            }
        }
    }

    async fn folder_deleted(&self, id: LocalId) -> Result<()> {
        if state::folder_by_local(&self.pool, id).await?.is_none() {
            return Ok(());
        }
        self.enqueue(Action::Delete, TargetType::Folder, id, json!({}))
            .await
    }

    async fn file_changed(&self, id: LocalId, parent: LocalId, name: &str) -> Result<()> {
        if self.hidden(name) {
            return Ok(());
        }
        let action = match state::file_by_local(&self.pool, id).await? {
            Some(mapping) => {
                let current = self.local.fingerprint(id).await?;
                if current == mapping.content_fingerprint {
                    tracing::trace!(local_id = %id, "content matches last sync, ignoring");
                    return Ok(());
                }
                Action::Update
            }
            None => Action::Create,
        };
        self.placed(action, TargetType::File, id, parent, name)
            .await
    }

    async fn file_moved(&self, id: LocalId, parent: LocalId, name: &str) -> Result<()> {
        let mapped = state::file_by_local(&self.pool, id).await?.is_some();
        match (mapped, self.hidden(name)) {
            (true, true) => self.file_deleted(id).await,
            (false, true) => Ok(()),
            (true, false) => {
                self.placed(Action::Move, TargetType::File, id, parent, name)
                    .await
            }
            (false, false) => {
                self.placed(Action::Create, TargetType::File, id, parent, name)
                    .await
            }
        }
    }

    async fn file_deleted(&self, id: LocalId) -> Result<()> {
        if state::file_by_local(&self.pool, id).await?.is_none() {
            return Ok(());
        }
        self.enqueue(Action::Delete, TargetType::File, id, json!({}))
            .await
    }
}

fn log_failure(what: &str, id: LocalId, result: Result<()>) {
    if let Err(e) = result {
        tracing::error!(local_id = %id, error = %e, "failed to record local {what}");
    }
}

#[async_trait]
impl LocalObserver for EventRecorder {
    async fn on_folder_created(&self, id: LocalId, parent: LocalId, name: &str) {
        log_failure("folder create", id, self.folder_created(id, parent, name).await);
    }

    async fn on_folder_renamed(&self, id: LocalId, parent: LocalId, new_name: &str) {
        let result = self
            .folder_relocated(Action::Rename, id, parent, new_name)
            .await;
        log_failure("folder rename", id, result);
    }

    async fn on_folder_moved(&self, id: LocalId, new_parent: LocalId, name: &str) {
        let result = self
            .folder_relocated(Action::Move, id, new_parent, name)
            .await;
        log_failure("folder move", id, result);
    }

    async fn on_folder_deleted(&self, id: LocalId) {
        log_failure("folder delete", id, self.folder_deleted(id).await);
    }

    async fn on_file_added(&self, id: LocalId, parent: LocalId, name: &str) {
        log_failure("file add", id, self.file_changed(id, parent, name).await);
    }

    async fn on_file_updated(&self, id: LocalId, parent: LocalId, name: &str) {
        log_failure("file update", id, self.file_changed(id, parent, name).await);
    }

    async fn on_file_moved(&self, id: LocalId, new_parent: LocalId, name: &str) {
        log_failure("file move", id, self.file_moved(id, new_parent, name).await);
    }

    async fn on_file_deleted(&self, id: LocalId) {
        log_failure("file delete", id, self.file_deleted(id).await);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::local::FsLocalStore;
    use crate::sync::queue::Status;
    use crate::testing::memory_pool;
    use crate::util::hash;

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: SqlitePool,
        queue: TaskQueue,
        store: Arc<FsLocalStore>,
        recorder: EventRecorder,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = memory_pool().await;
        let queue = TaskQueue::new(pool.clone(), QueueConfig { max_retries: 3 });
        let store = Arc::new(FsLocalStore::open(dir.path(), ".").await.unwrap());
        let recorder = EventRecorder::new(pool.clone(), queue.clone(), store.clone(), ".");
        Fixture {
            _dir: dir,
            pool,
            queue,
            store,
            recorder,
        }
    }

    #[tokio::test]
    async fn new_file_queues_create_with_placement() {
        let fx = fixture().await;
        std::fs::write(fx._dir.path().join("a.txt"), b"hello").unwrap();
        fx.store.rescan().await.unwrap();
        let id = fx.store.lookup_path("a.txt").unwrap().0;

        fx.recorder.on_file_added(id, LocalId::ROOT, "a.txt").await;

        let pending = fx.queue.list(Status::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action, Action::Create);
        assert_eq!(pending[0].target_id, id.to_string());
        let placement: LocalPlacement =
            serde_json::from_value(pending[0].payload.clone()).unwrap();
        assert_eq!(placement, LocalPlacement::new(LocalId::ROOT, "a.txt"));
    }

    #[tokio::test]
    async fn echo_of_synced_content_is_ignored() {
        let fx = fixture().await;
        std::fs::write(fx._dir.path().join("a.txt"), b"hello").unwrap();
        fx.store.rescan().await.unwrap();
        let id = fx.store.lookup_path("a.txt").unwrap().0;
        state::upsert_file(&fx.pool, id, "/r/a.txt", "id:1", &hash::content_hash(b"hello"))
            .await
            .unwrap();

        fx.recorder.on_file_updated(id, LocalId::ROOT, "a.txt").await;
        assert!(fx.queue.list(Status::Pending).await.unwrap().is_empty());

        std::fs::write(fx._dir.path().join("a.txt"), b"changed").unwrap();
        fx.recorder.on_file_updated(id, LocalId::ROOT, "a.txt").await;
        let pending = fx.queue.list(Status::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action, Action::Update);
    }

    #[tokio::test]
    async fn hidden_names_are_skipped() {
        let fx = fixture().await;
        fx.recorder
            .on_folder_created(LocalId(42), LocalId::ROOT, ".git")
            .await;
        fx.recorder
            .on_file_added(LocalId(43), LocalId::ROOT, ".DS_Store")
            .await;
        assert!(fx.queue.list(Status::Pending).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmapped_deletes_produce_nothing() {
        let fx = fixture().await;
        fx.recorder.on_file_deleted(LocalId(7)).await;
        fx.recorder.on_folder_deleted(LocalId(8)).await;
        assert!(fx.queue.list(Status::Pending).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rename_of_unsynced_folder_refreshes_its_create() {
        let fx = fixture().await;
        let id = LocalId(50);
        fx.recorder.on_folder_created(id, LocalId::ROOT, "old").await;
        fx.recorder.on_folder_renamed(id, LocalId::ROOT, "new").await;

        let pending = fx.queue.list(Status::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action, Action::Create);
        let placement: LocalPlacement =
            serde_json::from_value(pending[0].payload.clone()).unwrap();
        assert_eq!(placement.name.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn mapped_folder_rename_and_delete() {
        let fx = fixture().await;
        let id = LocalId(60);
        state::upsert_folder(&fx.pool, id, "/r/docs", "id:9")
            .await
            .unwrap();

        fx.recorder.on_folder_renamed(id, LocalId::ROOT, "papers").await;
        fx.recorder.on_folder_deleted(id).await;

        let actions: Vec<Action> = fx
            .queue
            .list(Status::Pending)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.action)
            .collect();
        assert!(actions.contains(&Action::Rename));
        assert!(actions.contains(&Action::Delete));
    }
}
