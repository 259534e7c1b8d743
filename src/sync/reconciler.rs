//! Turns remote change-feed entries, or a full enumeration of the remote
//! tree, into ordered tasks.
//!
//! Folders are handled shallowest first so a parent is always resolvable
//! before its children. A file or folder whose ancestors are neither mapped
//! nor part of the batch gets those ancestors materialized on the spot
//! (local folder plus mapping row), so no task is ever enqueued under a
//! parent nobody will create.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::config::{ConflictPolicy, ReconcileConfig};
use crate::error::{Result, SyncError};
use crate::local::{LocalError, LocalId, LocalKind, LocalStore};
use crate::remote::{RemoteClient, RemoteEntry};
use crate::util::path as sync_path;

use super::payload;
use super::queue::{Action, Direction, NewTask, TargetType, TaskQueue};
use super::state;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Folder,
    File,
}

/// One change-feed entry, as pushed by a webhook or produced from a
/// listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub change: ChangeKind,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub path: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl From<RemoteEntry> for ChangeEntry {
    fn from(entry: RemoteEntry) -> Self {
        match entry {
            RemoteEntry::Folder { id, path } => ChangeEntry {
                change: ChangeKind::Created,
                kind: EntryKind::Folder,
                path,
                id: Some(id),
                content_hash: None,
                size: None,
            },
            RemoteEntry::File(f) => ChangeEntry {
                change: ChangeKind::Modified,
                kind: EntryKind::File,
                path: f.path,
                id: Some(f.id),
                content_hash: Some(f.content_hash),
                size: Some(f.size),
            },
            // The feed does not type deletions; both mappings are checked.
            RemoteEntry::Deleted { path } => ChangeEntry {
                change: ChangeKind::Deleted,
                kind: EntryKind::File,
                path,
                id: None,
                content_hash: None,
                size: None,
            },
        }
    }
}

/// What one reconcile pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub folders: usize,
    pub files: usize,
    pub deletions: usize,
    pub conflicts: usize,
    pub materialized: usize,
    pub unchanged: usize,
    pub ignored: usize,
}

impl ReconcileReport {
    pub fn enqueued(&self) -> usize {
        self.folders + self.files + self.deletions
    }

    pub(crate) fn absorb(&mut self, other: ReconcileReport) {
        self.folders += other.folders;
        self.files += other.files;
        self.deletions += other.deletions;
        self.conflicts += other.conflicts;
        self.materialized += other.materialized;
        self.unchanged += other.unchanged;
        self.ignored += other.ignored;
    }
}

/// Folders the current batch knows about, keyed by lower-cased path.
#[derive(Default)]
struct Batch {
    /// Mapped (or materialized) during this batch.
    resolved: HashMap<String, LocalId>,
    /// Folder-create task enqueued during this batch.
    pending: HashSet<String>,
}

pub struct Reconciler {
    pool: SqlitePool,
    queue: TaskQueue,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteClient>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        pool: SqlitePool,
        queue: TaskQueue,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            local,
            remote,
            config,
        }
    }

    pub fn remote_root(&self) -> &str {
        &self.config.remote_root
    }

    /// Enqueue tasks for one batch of change entries. The caller advances the
    /// cursor only after this returns `Ok`.
    pub async fn reconcile(&self, entries: &[ChangeEntry]) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let root = &self.config.remote_root;

        // Only the last entry for a path counts. A replaced entry shows up as
        // a deletion followed by the new entry at the same path.
        let last_seen: HashMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (sync_path::path_lower(&entry.path), i))
            .collect();

        let mut folders = Vec::new();
        let mut files = Vec::new();
        let mut deletions = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            let key = sync_path::path_lower(&entry.path);
            let inside = sync_path::is_under(root, &entry.path)
                && key != sync_path::path_lower(root);
            if !inside || sync_path::is_hidden(root, &entry.path, &self.config.hidden_prefix) {
                report.ignored += 1;
                continue;
            }
            if last_seen.get(&key) != Some(&i) {
                tracing::debug!(path = %entry.path, change = ?entry.change, "superseded later in the batch");
                report.ignored += 1;
                continue;
            }
            match (entry.change, entry.kind) {
                (ChangeKind::Deleted, _) => deletions.push(entry),
                (_, EntryKind::Folder) => folders.push(entry),
                (_, EntryKind::File) => files.push(entry),
            }
        }

        folders.sort_by(|a, b| {
            sync_path::depth(&a.path)
                .cmp(&sync_path::depth(&b.path))
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut batch = Batch::default();
        for entry in folders {
            self.reconcile_folder(entry, &mut batch, &mut report).await?;
        }
        for entry in files {
            self.reconcile_file(entry, &mut batch, &mut report).await?;
        }
        for entry in deletions {
            self.reconcile_deletion(entry, &mut report).await?;
        }

        tracing::debug!(
            entries = entries.len(),
            enqueued = report.enqueued(),
            conflicts = report.conflicts,
            "change batch reconciled"
        );
        Ok(report)
    }

    async fn reconcile_folder(
        &self,
        entry: &ChangeEntry,
        batch: &mut Batch,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let path = sync_path::normalize_remote(&entry.path);
        let key = sync_path::path_lower(&path);
        if batch.resolved.contains_key(&key) || batch.pending.contains(&key) {
            return Ok(());
        }
        if let Some(m) = state::folder_by_path(&self.pool, &path).await? {
            batch.resolved.insert(key, m.local_folder_id);
            report.unchanged += 1;
            return Ok(());
        }

        if let Some(parent) = sync_path::parent(&path) {
            self.ensure_folder(&parent, batch, report).await?;
        }

        let task = NewTask::new(
            Action::Create,
            TargetType::Folder,
            key.clone(),
            Direction::RemoteToLocal,
            serde_json::to_value(payload::RemoteFolder {
                path,
                id: entry.id.clone(),
            })?,
        );
        self.queue.enqueue(&task).await?;
        batch.pending.insert(key);
        report.folders += 1;
        Ok(())
    }

    async fn reconcile_file(
        &self,
        entry: &ChangeEntry,
        batch: &mut Batch,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let path = sync_path::normalize_remote(&entry.path);
        let incoming = entry.content_hash.as_deref();

        let Some(mapping) = state::file_by_path(&self.pool, &path).await? else {
            if let Some(parent) = sync_path::parent(&path) {
                self.ensure_folder(&parent, batch, report).await?;
            }
            self.enqueue_download(Action::Create, &path, entry).await?;
            report.files += 1;
            return Ok(());
        };

        if incoming == Some(mapping.content_fingerprint.as_str()) {
            report.unchanged += 1;
            return Ok(());
        }

        let local = match self.local.fingerprint(mapping.local_file_id).await {
            Ok(fp) => fp,
            Err(LocalError::NotFound(_)) => {
                tracing::info!(
                    path = %path,
                    local_id = %mapping.local_file_id,
                    "mapped local file is gone, leaving it to the local delete"
                );
                report.unchanged += 1;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if local == mapping.content_fingerprint {
            self.enqueue_download(Action::Update, &path, entry).await?;
            report.files += 1;
        } else if Some(local.as_str()) == incoming {
            // Both sides hold the same bytes already.
            state::set_file_fingerprint(&self.pool, mapping.local_file_id, &local).await?;
            report.unchanged += 1;
        } else {
            report.conflicts += 1;
            match self.config.conflict_policy {
                ConflictPolicy::RemoteWins => {
                    tracing::warn!(path = %path, "conflict: both sides changed, remote wins");
                    self.enqueue_download(Action::Update, &path, entry).await?;
                    report.files += 1;
                }
                ConflictPolicy::LocalWins => {
                    tracing::warn!(path = %path, "conflict: both sides changed, keeping local");
                }
            }
        }
        Ok(())
    }

    async fn enqueue_download(&self, action: Action, path: &str, entry: &ChangeEntry) -> Result<()> {
        let task = NewTask::new(
            action,
            TargetType::File,
            sync_path::path_lower(path),
            Direction::RemoteToLocal,
            serde_json::to_value(payload::RemoteFile {
                path: path.to_string(),
                id: entry.id.clone(),
                content_hash: entry.content_hash.clone(),
                size: entry.size,
            })?,
        );
        self.queue.enqueue(&task).await?;
        Ok(())
    }

    async fn reconcile_deletion(
        &self,
        entry: &ChangeEntry,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let path = sync_path::normalize_remote(&entry.path);

        let (target_type, local_id) = if let Some(m) = state::file_by_path(&self.pool, &path).await? {
            (TargetType::File, m.local_file_id)
        } else if let Some(m) = state::folder_by_path(&self.pool, &path).await? {
            (TargetType::Folder, m.local_folder_id)
        } else {
            report.unchanged += 1;
            return Ok(());
        };

        let task = NewTask::new(
            Action::Delete,
            target_type,
            sync_path::path_lower(&path),
            Direction::RemoteToLocal,
            serde_json::to_value(payload::RemoteDelete { path, local_id })?,
        );
        self.queue.enqueue(&task).await?;
        report.deletions += 1;
        Ok(())
    }

    /// Make sure the folder at `path` is mapped or about to be. Walks up to
    /// the nearest known ancestor, then creates the missing folders top-down.
    async fn ensure_folder(
        &self,
        path: &str,
        batch: &mut Batch,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let root = &self.config.remote_root;
        let mut missing = Vec::new();
        let mut current = sync_path::normalize_remote(path);

        let mut parent_id = loop {
            let key = sync_path::path_lower(&current);
            if key == sync_path::path_lower(root) {
                break LocalId::ROOT;
            }
            if batch.pending.contains(&key) {
                // The task creating it is already queued ahead of us.
                if missing.is_empty() {
                    return Ok(());
                }
                // Unusual: a pending folder with unmapped descendants outside
                // the batch. Map it now so they have a parent.
                break self.materialize(&current, batch, report).await?;
            }
            if let Some(id) = batch.resolved.get(&key) {
                break *id;
            }
            if let Some(m) = state::folder_by_path(&self.pool, &current).await? {
                batch.resolved.insert(key, m.local_folder_id);
                break m.local_folder_id;
            }
            if !sync_path::is_under(root, &current) {
                return Err(SyncError::Invalid(format!("{current} is outside the sync root")));
            }
            missing.push(current.clone());
            match sync_path::parent(&current) {
                Some(p) => current = p,
                None => break LocalId::ROOT,
            }
        };

        while let Some(path) = missing.pop() {
            let name = sync_path::file_name(&path);
            let id = self.local.create_folder(parent_id, name).await?;
            state::upsert_folder(&self.pool, id, &path, "").await?;
            batch.resolved.insert(sync_path::path_lower(&path), id);
            report.materialized += 1;
            tracing::info!(path = %path, local_id = %id, "ancestor folder materialized");
            parent_id = id;
        }
        Ok(())
    }

    /// Create a batch-pending folder right away.
    async fn materialize(
        &self,
        path: &str,
        batch: &mut Batch,
        report: &mut ReconcileReport,
    ) -> Result<LocalId> {
        let parent = sync_path::parent(path).unwrap_or_default();
        let parent_id = state::folder_local_id(&self.pool, &self.config.remote_root, &parent)
            .await?
            .ok_or_else(|| SyncError::NotReady(format!("parent folder {parent}")))?;
        let id = self
            .local
            .create_folder(parent_id, sync_path::file_name(path))
            .await?;
        state::upsert_folder(&self.pool, id, path, "").await?;
        let key = sync_path::path_lower(path);
        batch.pending.remove(&key);
        batch.resolved.insert(key, id);
        report.materialized += 1;
        Ok(id)
    }

    /// Enumeration mode: list the whole remote tree page by page, reconcile
    /// each page, store the final cursor, then push local content that has
    /// no mapping and no remote counterpart.
    pub async fn full_sync(&self) -> Result<ReconcileReport> {
        let root = self.config.remote_root.clone();
        let mut report = ReconcileReport::default();
        let mut seen: HashSet<String> = HashSet::new();

        let mut page = self.remote.list_folder(&root, true).await?;
        loop {
            let entries: Vec<ChangeEntry> =
                page.entries.into_iter().map(ChangeEntry::from).collect();
            seen.extend(entries.iter().map(|e| sync_path::path_lower(&e.path)));
            report.absorb(self.reconcile(&entries).await?);

            if !page.has_more {
                break;
            }
            page = self.remote.list_folder_continue(&page.cursor).await?;
        }
        state::set_cursor(&self.pool, &root, &page.cursor, false).await?;

        report.absorb(self.push_unmapped_local(&seen).await?);
        tracing::info!(
            folders = report.folders,
            files = report.files,
            materialized = report.materialized,
            "full sync enumerated"
        );
        Ok(report)
    }

    /// Walk the local tree and enqueue local-to-remote creates for entries
    /// that are neither mapped nor present remotely.
    async fn push_unmapped_local(&self, remote_seen: &HashSet<String>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut stack = vec![(LocalId::ROOT, self.config.remote_root.clone())];

        while let Some((folder, folder_path)) = stack.pop() {
            for child in self.local.list_children(folder).await? {
                if sync_path::is_hidden_name(&child.name, &self.config.hidden_prefix) {
                    continue;
                }
                let child_path = sync_path::join(&folder_path, &child.name);
                let known_remote = remote_seen.contains(&sync_path::path_lower(&child_path));

                match child.kind {
                    LocalKind::Folder => {
                        let mapped = state::folder_by_local(&self.pool, child.id).await?;
                        if mapped.is_none() && !known_remote {
                            self.enqueue_upload(TargetType::Folder, child.id, folder, &child.name)
                                .await?;
                            report.folders += 1;
                        }
                        stack.push((child.id, child_path));
                    }
                    LocalKind::File => {
                        let mapped = state::file_by_local(&self.pool, child.id).await?;
                        if mapped.is_none() && !known_remote {
                            self.enqueue_upload(TargetType::File, child.id, folder, &child.name)
                                .await?;
                            report.files += 1;
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    async fn enqueue_upload(
        &self,
        target_type: TargetType,
        id: LocalId,
        parent: LocalId,
        name: &str,
    ) -> Result<()> {
        let task = NewTask::new(
            Action::Create,
            target_type,
            id.to_string(),
            Direction::LocalToRemote,
            serde_json::to_value(payload::LocalPlacement::new(parent, name))?,
        );
        self.queue.enqueue(&task).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::local::FsLocalStore;
    use crate::sync::queue::Status;
    use crate::testing::{MemoryRemote, memory_pool};
    use crate::util::hash::content_hash;

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: SqlitePool,
        queue: TaskQueue,
        local: Arc<FsLocalStore>,
        remote: Arc<MemoryRemote>,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let pool = memory_pool().await;
            Self {
                queue: TaskQueue::new(pool.clone(), QueueConfig { max_retries: 3 }),
                local: Arc::new(FsLocalStore::open(dir.path(), ".").await.unwrap()),
                remote: Arc::new(MemoryRemote::new()),
                pool,
                _dir: dir,
            }
        }

        fn reconciler(&self, policy: ConflictPolicy) -> Reconciler {
            Reconciler::new(
                self.pool.clone(),
                self.queue.clone(),
                self.local.clone(),
                self.remote.clone(),
                ReconcileConfig {
                    remote_root: "/root".into(),
                    hidden_prefix: ".".into(),
                    conflict_policy: policy,
                },
            )
        }

        async fn pending(&self) -> Vec<(Action, TargetType, String)> {
            self.queue
                .list(Status::Pending)
                .await
                .unwrap()
                .into_iter()
                .map(|t| (t.action, t.target_type, t.target_id))
                .collect()
        }

        /// A synced local file under the root with the given content.
        async fn synced_file(&self, name: &str, content: &[u8]) -> LocalId {
            let staged = self.local.staging_path().await.unwrap();
            tokio::fs::write(&staged, content).await.unwrap();
            let id = self
                .local
                .install_file(LocalId::ROOT, name, &staged)
                .await
                .unwrap();
            let path = format!("/root/{name}");
            state::upsert_file(&self.pool, id, &path, "id:f", &content_hash(content))
                .await
                .unwrap();
            id
        }
    }

    fn folder(path: &str) -> ChangeEntry {
        ChangeEntry {
            change: ChangeKind::Created,
            kind: EntryKind::Folder,
            path: path.into(),
            id: None,
            content_hash: None,
            size: None,
        }
    }

    fn file(path: &str, content: &[u8]) -> ChangeEntry {
        ChangeEntry {
            change: ChangeKind::Modified,
            kind: EntryKind::File,
            path: path.into(),
            id: Some("id:f".into()),
            content_hash: Some(content_hash(content)),
            size: Some(content.len() as u64),
        }
    }

    fn deleted(path: &str) -> ChangeEntry {
        ChangeEntry {
            change: ChangeKind::Deleted,
            kind: EntryKind::File,
            path: path.into(),
            id: None,
            content_hash: None,
            size: None,
        }
    }

    #[tokio::test]
    async fn folders_precede_files_whatever_the_input_order() {
        let fx = Fixture::new().await;
        let entries = vec![
            file("/root/a/b/c.txt", b"c"),
            folder("/root/a/b"),
            folder("/root/a"),
        ];
        fx.reconciler(ConflictPolicy::RemoteWins)
            .reconcile(&entries)
            .await
            .unwrap();

        assert_eq!(
            fx.pending().await,
            vec![
                (Action::Create, TargetType::Folder, "/root/a".to_string()),
                (Action::Create, TargetType::Folder, "/root/a/b".to_string()),
                (Action::Create, TargetType::File, "/root/a/b/c.txt".to_string()),
            ]
        );
        // Parents come from the batch itself; nothing was materialized.
        assert_eq!(state::mapping_counts(&fx.pool).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn missing_ancestors_are_materialized_once() {
        let fx = Fixture::new().await;
        let entries = vec![
            file("/root/x/y/one.txt", b"1"),
            file("/root/x/y/two.txt", b"2"),
        ];
        let report = fx
            .reconciler(ConflictPolicy::RemoteWins)
            .reconcile(&entries)
            .await
            .unwrap();

        assert_eq!(report.materialized, 2);
        assert_eq!(report.files, 2);
        let y = state::folder_by_path(&fx.pool, "/root/x/y").await.unwrap().unwrap();
        assert_eq!(
            fx.local.stat(y.local_folder_id).await.unwrap().name,
            "y"
        );
    }

    #[tokio::test]
    async fn outside_and_hidden_entries_are_ignored() {
        let fx = Fixture::new().await;
        let entries = vec![
            folder("/elsewhere/a"),
            folder("/root/.cache"),
            file("/root/.cache/blob", b"x"),
            folder("/root"),
        ];
        let report = fx
            .reconciler(ConflictPolicy::RemoteWins)
            .reconcile(&entries)
            .await
            .unwrap();
        assert_eq!(report.ignored, 4);
        assert!(fx.pending().await.is_empty());
    }

    #[tokio::test]
    async fn remote_only_change_is_an_update() {
        let fx = Fixture::new().await;
        fx.synced_file("a.txt", b"v1").await;

        fx.reconciler(ConflictPolicy::LocalWins)
            .reconcile(&[file("/root/a.txt", b"v2")])
            .await
            .unwrap();
        assert_eq!(
            fx.pending().await,
            vec![(Action::Update, TargetType::File, "/root/a.txt".to_string())]
        );
    }

    #[tokio::test]
    async fn conflicts_follow_policy() {
        for (policy, expected) in [(ConflictPolicy::RemoteWins, 1), (ConflictPolicy::LocalWins, 0)] {
            let fx = Fixture::new().await;
            fx.synced_file("a.txt", b"base").await;
            // Local edit after the last sync.
            std::fs::write(fx._dir.path().join("a.txt"), b"local edit").unwrap();

            let report = fx
                .reconciler(policy)
                .reconcile(&[file("/root/a.txt", b"remote edit")])
                .await
                .unwrap();
            assert_eq!(report.conflicts, 1);

            let pending = fx.pending().await;
            assert_eq!(pending.len(), expected, "{policy:?}");
            if expected == 1 {
                assert_eq!(pending[0].0, Action::Update);
            }
        }
    }

    #[tokio::test]
    async fn converged_content_refreshes_baseline() {
        let fx = Fixture::new().await;
        let id = fx.synced_file("a.txt", b"base").await;
        std::fs::write(fx._dir.path().join("a.txt"), b"same").unwrap();

        let report = fx
            .reconciler(ConflictPolicy::RemoteWins)
            .reconcile(&[file("/root/a.txt", b"same")])
            .await
            .unwrap();
        assert_eq!(report.conflicts, 0);
        assert!(fx.pending().await.is_empty());
        let m = state::file_by_local(&fx.pool, id).await.unwrap().unwrap();
        assert_eq!(m.content_fingerprint, content_hash(b"same"));
    }

    #[tokio::test]
    async fn deletions_hit_file_then_folder_mappings() {
        let fx = Fixture::new().await;
        fx.synced_file("a.txt", b"x").await;
        state::upsert_folder(&fx.pool, LocalId(99), "/root/dir", "").await.unwrap();

        let report = fx
            .reconciler(ConflictPolicy::RemoteWins)
            .reconcile(&[deleted("/root/a.txt"), deleted("/root/dir"), deleted("/root/nope")])
            .await
            .unwrap();
        assert_eq!(report.deletions, 2);
        assert_eq!(
            fx.pending().await,
            vec![
                (Action::Delete, TargetType::File, "/root/a.txt".to_string()),
                (Action::Delete, TargetType::Folder, "/root/dir".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn replaced_file_is_updated_not_deleted() {
        let fx = Fixture::new().await;
        fx.synced_file("a.txt", b"v1").await;

        let report = fx
            .reconciler(ConflictPolicy::RemoteWins)
            .reconcile(&[deleted("/root/a.txt"), file("/root/A.txt", b"v2 replaced")])
            .await
            .unwrap();
        assert_eq!(report.deletions, 0);
        assert_eq!(report.files, 1);
        assert_eq!(
            fx.pending().await,
            vec![(Action::Update, TargetType::File, "/root/a.txt".to_string())]
        );
    }

    #[tokio::test]
    async fn file_removed_after_its_change_is_only_deleted() {
        let fx = Fixture::new().await;
        fx.synced_file("a.txt", b"v1").await;

        let report = fx
            .reconciler(ConflictPolicy::RemoteWins)
            .reconcile(&[file("/root/a.txt", b"v2"), deleted("/root/a.txt")])
            .await
            .unwrap();
        assert_eq!(report.files, 0);
        assert_eq!(
            fx.pending().await,
            vec![(Action::Delete, TargetType::File, "/root/a.txt".to_string())]
        );
    }

    #[tokio::test]
    async fn full_sync_enumerates_remote_and_pushes_local_only_content() {
        let fx = Fixture::new().await;
        fx.remote.put_folder("/root/Docs");
        fx.remote.put_file("/root/Docs/report.pdf", &[7u8; 2048]);
        std::fs::create_dir(fx._dir.path().join("Local")).unwrap();
        std::fs::write(fx._dir.path().join("Local/note.txt"), b"n").unwrap();
        fx.local.rescan().await.unwrap();

        let report = fx
            .reconciler(ConflictPolicy::RemoteWins)
            .full_sync()
            .await
            .unwrap();
        assert_eq!(report.folders, 2);
        assert_eq!(report.files, 2);

        let cursor = state::get_cursor(&fx.pool, "/root").await.unwrap().unwrap();
        assert!(!cursor.has_more);

        let pending = fx.queue.list(Status::Pending).await.unwrap();
        let directions: Vec<(TargetType, Direction)> =
            pending.iter().map(|t| (t.target_type, t.direction)).collect();
        assert_eq!(
            directions,
            vec![
                (TargetType::Folder, Direction::RemoteToLocal),
                (TargetType::Folder, Direction::LocalToRemote),
                (TargetType::File, Direction::RemoteToLocal),
                (TargetType::File, Direction::LocalToRemote),
            ]
        );
    }
}
