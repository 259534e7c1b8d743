//! Folder and file task handlers.
//!
//! Each handler performs one task and writes the mapping store on success.
//! Handlers return errors untouched; the worker loop decides what a failure
//! means for the task.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::error::{Result, SyncError};
use crate::local::{LocalError, LocalId, LocalKind, LocalStore};
use crate::remote::{RemoteClient, RemoteError};
use crate::util::path as sync_path;

use super::payload::{self, LocalPlacement};
use super::queue::{Action, Direction, TargetType, Task};
use super::reconciler::Reconciler;
use super::state;
use super::transfer::TransferEngine;

pub struct Handlers {
    pool: SqlitePool,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteClient>,
    transfer: TransferEngine,
    reconciler: Arc<Reconciler>,
    remote_root: String,
}

impl Handlers {
    pub fn new(
        pool: SqlitePool,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        transfer: TransferEngine,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        let remote_root = reconciler.remote_root().to_string();
        Self {
            pool,
            local,
            remote,
            transfer,
            reconciler,
            remote_root,
        }
    }

    pub async fn dispatch(&self, task: &Task) -> Result<()> {
        use Action::*;
        use Direction::*;

        match (task.target_type, task.action, task.direction) {
            (TargetType::System, FullSync, _) => {
                let report = self.reconciler.full_sync().await?;
                tracing::info!(enqueued = report.enqueued(), "full sync reconciled");
                Ok(())
            }

            (TargetType::Folder, Create, LocalToRemote) => self.push_folder(task).await,
            (TargetType::Folder, Rename | Move, LocalToRemote) => self.relocate_folder(task).await,
            (TargetType::Folder, Delete, LocalToRemote) => self.delete_remote_folder(task).await,
            (TargetType::Folder, Create, RemoteToLocal) => self.pull_folder(task).await,
            (TargetType::Folder, Delete, RemoteToLocal) => self.delete_local_folder(task).await,

            (TargetType::File, Create | Update, LocalToRemote) => self.push_file(task).await,
            (TargetType::File, Rename | Move, LocalToRemote) => self.relocate_file(task).await,
            (TargetType::File, Delete, LocalToRemote) => self.delete_remote_file(task).await,
            (TargetType::File, Create | Update, RemoteToLocal) => self.pull_file(task).await,
            (TargetType::File, Delete, RemoteToLocal) => self.delete_local_file(task).await,

            (target, action, direction) => Err(SyncError::Invalid(format!(
                "no handler for {action} {target} {direction}"
            ))),
        }
    }

    // ── helpers ─────────────────────────────────────────────────────

    fn local_target(task: &Task) -> Result<LocalId> {
        task.target_id
            .parse::<i64>()
            .map(LocalId)
            .map_err(|_| SyncError::Invalid(format!("bad local id {:?}", task.target_id)))
    }

    fn placement(task: &Task) -> Result<(LocalId, String)> {
        let p: LocalPlacement = serde_json::from_value(task.payload.clone())?;
        match (p.parent_id, p.name) {
            (Some(parent), Some(name)) if !name.is_empty() => Ok((parent, name)),
            _ => Err(SyncError::Invalid(format!(
                "task {} needs parent_id and name",
                task.id
            ))),
        }
    }

    /// Remote path for `name` inside local folder `parent`, once the parent
    /// is synced.
    async fn remote_path_in(&self, parent: LocalId, name: &str) -> Result<String> {
        let parent_path = state::folder_remote_path(&self.pool, &self.remote_root, parent)
            .await?
            .ok_or_else(|| SyncError::NotReady(format!("parent folder {parent}")))?;
        Ok(sync_path::join(&parent_path, name))
    }

    /// Local folder holding the remote path's parent, once it is synced.
    async fn local_parent_of(&self, remote_path: &str) -> Result<LocalId> {
        let parent = sync_path::parent(remote_path).unwrap_or_default();
        state::folder_local_id(&self.pool, &self.remote_root, &parent)
            .await?
            .ok_or_else(|| SyncError::NotReady(format!("parent folder {parent}")))
    }

    // ── folders, local to remote ────────────────────────────────────

    async fn push_folder(&self, task: &Task) -> Result<()> {
        let id = Self::local_target(task)?;
        let (parent, name) = Self::placement(task)?;
        if state::folder_by_local(&self.pool, id).await?.is_some() {
            tracing::debug!(local_id = %id, "folder already mapped");
            return Ok(());
        }
        // Gone since the event fired.
        self.local.stat(id).await?;

        let path = self.remote_path_in(parent, &name).await?;
        let fingerprint = match self.remote.create_folder(&path).await {
            Ok(remote_id) => remote_id,
            Err(RemoteError::AlreadyExists(_)) => {
                tracing::debug!(path = %path, "remote folder exists, adopting it");
                String::new()
            }
            Err(e) => return Err(e.into()),
        };
        state::upsert_folder(&self.pool, id, &path, &fingerprint).await?;
        tracing::info!(path = %path, local_id = %id, "folder created remotely");
        Ok(())
    }

    async fn relocate_folder(&self, task: &Task) -> Result<()> {
        let id = Self::local_target(task)?;
        let (parent, name) = Self::placement(task)?;
        let mapping = state::folder_by_local(&self.pool, id)
            .await?
            .ok_or_else(|| SyncError::MappingMissing(format!("folder {id}")))?;

        let new_path = self.remote_path_in(parent, &name).await?;
        if new_path == mapping.remote_path {
            return Ok(());
        }
        self.remote.move_entry(&mapping.remote_path, &new_path).await?;
        let rows =
            state::relocate_folder(&self.pool, id, &new_path, &mapping.fingerprint).await?;
        tracing::info!(
            from = %mapping.remote_path,
            to = %new_path,
            mappings = rows,
            "folder {} remotely",
            task.action
        );
        Ok(())
    }

    async fn delete_remote_folder(&self, task: &Task) -> Result<()> {
        let id = Self::local_target(task)?;
        let Some(mapping) = state::folder_by_local(&self.pool, id).await? else {
            tracing::debug!(local_id = %id, "deleted folder was never synced");
            return Ok(());
        };
        match self.remote.delete(&mapping.remote_path).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let rows = state::delete_folder_tree(&self.pool, &mapping.remote_path).await?;
        tracing::info!(path = %mapping.remote_path, mappings = rows, "folder deleted remotely");
        Ok(())
    }

    // ── folders, remote to local ────────────────────────────────────

    async fn pull_folder(&self, task: &Task) -> Result<()> {
        let p: payload::RemoteFolder = serde_json::from_value(task.payload.clone())?;
        if state::folder_by_path(&self.pool, &p.path).await?.is_some() {
            return Ok(());
        }
        let parent = self.local_parent_of(&p.path).await?;
        let id = self
            .local
            .create_folder(parent, sync_path::file_name(&p.path))
            .await?;
        state::upsert_folder(&self.pool, id, &p.path, p.id.as_deref().unwrap_or_default())
            .await?;
        tracing::info!(path = %p.path, local_id = %id, "folder created locally");
        Ok(())
    }

    async fn delete_local_folder(&self, task: &Task) -> Result<()> {
        let p: payload::RemoteDelete = serde_json::from_value(task.payload.clone())?;
        let Some(mapping) = state::folder_by_path(&self.pool, &p.path).await? else {
            return Ok(());
        };
        match self.local.delete_folder(mapping.local_folder_id).await {
            Ok(()) | Err(LocalError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let rows = state::delete_folder_tree(&self.pool, &mapping.remote_path).await?;
        tracing::info!(path = %p.path, mappings = rows, "folder deleted locally");
        Ok(())
    }

    // ── files, local to remote ──────────────────────────────────────

    async fn push_file(&self, task: &Task) -> Result<()> {
        let id = Self::local_target(task)?;
        let (parent, name) = Self::placement(task)?;
        let mapping = state::file_by_local(&self.pool, id).await?;

        let fingerprint = self.local.fingerprint(id).await?;
        if let Some(m) = &mapping
            && m.content_fingerprint == fingerprint
        {
            tracing::debug!(path = %m.remote_path, "content unchanged, nothing to upload");
            return Ok(());
        }

        let path = match &mapping {
            Some(m) => m.remote_path.clone(),
            None => self.remote_path_in(parent, &name).await?,
        };
        let meta = self.transfer.upload(id, &path).await?;
        let synced = if meta.content_hash.is_empty() {
            fingerprint
        } else {
            meta.content_hash
        };
        state::upsert_file(&self.pool, id, &path, &meta.id, &synced).await?;
        Ok(())
    }

    async fn relocate_file(&self, task: &Task) -> Result<()> {
        let id = Self::local_target(task)?;
        let (parent, name) = Self::placement(task)?;
        let mapping = state::file_by_local(&self.pool, id)
            .await?
            .ok_or_else(|| SyncError::MappingMissing(format!("file {id}")))?;

        let new_path = self.remote_path_in(parent, &name).await?;
        if new_path == mapping.remote_path {
            return Ok(());
        }
        self.remote.move_entry(&mapping.remote_path, &new_path).await?;
        state::set_file_path(&self.pool, id, &new_path).await?;
        tracing::info!(from = %mapping.remote_path, to = %new_path, "file moved remotely");
        Ok(())
    }

    async fn delete_remote_file(&self, task: &Task) -> Result<()> {
        let id = Self::local_target(task)?;
        let Some(mapping) = state::file_by_local(&self.pool, id).await? else {
            tracing::debug!(local_id = %id, "deleted file was never synced");
            return Ok(());
        };
        match self.remote.delete(&mapping.remote_path).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        state::delete_file(&self.pool, id).await?;
        tracing::info!(path = %mapping.remote_path, "file deleted remotely");
        Ok(())
    }

    // ── files, remote to local ──────────────────────────────────────

    async fn pull_file(&self, task: &Task) -> Result<()> {
        let p: payload::RemoteFile = serde_json::from_value(task.payload.clone())?;
        let name = sync_path::file_name(&p.path).to_string();
        let parent = self.local_parent_of(&p.path).await?;

        if let Some(m) = state::file_by_path(&self.pool, &p.path).await?
            && p.content_hash.as_deref() == Some(m.content_fingerprint.as_str())
        {
            tracing::debug!(path = %p.path, "already in sync");
            return Ok(());
        }

        // An unmapped local file with identical content only needs a mapping.
        if task.action == Action::Create
            && let Some(expected) = p.content_hash.as_deref()
            && let Some(existing) = self
                .local
                .list_children(parent)
                .await?
                .into_iter()
                .find(|c| c.kind == LocalKind::File && c.name == name)
            && self.local.fingerprint(existing.id).await? == expected
        {
            let remote_id = p.id.clone().unwrap_or_default();
            state::upsert_file(&self.pool, existing.id, &p.path, &remote_id, expected).await?;
            tracing::info!(path = %p.path, "identical local file adopted");
            return Ok(());
        }

        let installed = self.transfer.download(&p.path, parent, &name).await?;
        state::upsert_file(
            &self.pool,
            installed.local_id,
            &p.path,
            &installed.meta.id,
            &installed.meta.content_hash,
        )
        .await?;
        Ok(())
    }

    async fn delete_local_file(&self, task: &Task) -> Result<()> {
        let p: payload::RemoteDelete = serde_json::from_value(task.payload.clone())?;
        let Some(mapping) = state::file_by_path(&self.pool, &p.path).await? else {
            return Ok(());
        };
        match self.local.delete_file(mapping.local_file_id).await {
            Ok(()) | Err(LocalError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        state::delete_file(&self.pool, mapping.local_file_id).await?;
        tracing::info!(path = %p.path, "file deleted locally");
        Ok(())
    }
}
