use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::util::{hash, path as sync_path};

use super::{LocalEntry, LocalError, LocalId, LocalKind, LocalStore};

/// Directory below the root that holds downloads in progress. Its name
/// starts with `.` so the watcher and listings skip it.
const STAGING_DIR: &str = ".treesync-staging";

/// Local store over a directory tree. Ids are inode numbers, which survive
/// rename and move; the root directory is always [`LocalId::ROOT`].
pub struct FsLocalStore {
    root: PathBuf,
    staging: PathBuf,
    hidden_prefix: String,
    index: Mutex<Index>,
}

/// In-memory id <-> relative path table. Paths use `/` and are relative to
/// the root; the root itself is the empty string.
#[derive(Default)]
struct Index {
    by_id: HashMap<LocalId, (String, LocalKind)>,
    by_path: HashMap<String, LocalId>,
}

impl Index {
    fn insert(&mut self, id: LocalId, rel: String, kind: LocalKind) {
        if let Some((old, _)) = self.by_id.get(&id)
            && *old != rel
        {
            self.by_path.remove(old);
        }
        if let Some(previous) = self.by_path.insert(rel.clone(), id)
            && previous != id
        {
            self.by_id.remove(&previous);
        }
        self.by_id.insert(id, (rel, kind));
    }

    fn remove_subtree(&mut self, rel: &str) {
        let prefix = format!("{rel}/");
        let doomed: Vec<String> = self
            .by_path
            .keys()
            .filter(|p| p.as_str() == rel || p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in doomed {
            if let Some(id) = self.by_path.remove(&p) {
                self.by_id.remove(&id);
            }
        }
    }

    fn rebase(&mut self, old: &str, new: &str) {
        let prefix = format!("{old}/");
        let moved: Vec<(String, LocalId)> = self
            .by_path
            .iter()
            .filter(|(p, _)| p.as_str() == old || p.starts_with(&prefix))
            .map(|(p, id)| (p.clone(), *id))
            .collect();
        for (p, _) in &moved {
            self.by_path.remove(p);
        }
        for (p, id) in moved {
            let rel = format!("{new}{}", &p[old.len()..]);
            if let Some(entry) = self.by_id.get_mut(&id) {
                entry.0 = rel.clone();
            }
            self.by_path.insert(rel, id);
        }
    }
}

fn parent_rel(rel: &str) -> &str {
    rel.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

fn join_rel(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn kind_of(meta: &std::fs::Metadata) -> LocalKind {
    if meta.is_dir() {
        LocalKind::Folder
    } else {
        LocalKind::File
    }
}

fn validate_name(name: &str) -> Result<(), LocalError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(LocalError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl FsLocalStore {
    /// Open the tree at `root`, creating it if needed, and index it.
    pub async fn open(root: &Path, hidden_prefix: &str) -> Result<Self, LocalError> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| LocalError::io(root, e))?;
        let staging = root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| LocalError::io(&staging, e))?;

        let store = Self {
            root: root.to_path_buf(),
            staging,
            hidden_prefix: hidden_prefix.to_string(),
            index: Mutex::new(Index::default()),
        };
        store.rescan().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_hidden(&self, name: &str) -> bool {
        name == STAGING_DIR || sync_path::is_hidden_name(name, &self.hidden_prefix)
    }

    /// Rebuild the id index from disk.
    pub async fn rescan(&self) -> Result<(), LocalError> {
        let mut fresh = Index::default();
        let mut stack = vec![String::new()];

        while let Some(dir_rel) = stack.pop() {
            let dir = self.abs(&dir_rel);
            let mut read_dir = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| LocalError::io(&dir, e))?;
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| LocalError::io(&dir, e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if self.is_hidden(&name) {
                    continue;
                }
                let Ok(meta) = tokio::fs::symlink_metadata(entry.path()).await else {
                    continue;
                };
                if meta.is_symlink() {
                    continue;
                }
                let rel = join_rel(&dir_rel, &name);
                let kind = kind_of(&meta);
                fresh.insert(LocalId(meta.ino() as i64), rel.clone(), kind);
                if kind == LocalKind::Folder {
                    stack.push(rel);
                }
            }
        }

        let count = fresh.by_id.len();
        *self.lock() = fresh;
        tracing::debug!(root = %self.root.display(), entries = count, "local index rebuilt");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn abs(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    fn rel_of(&self, id: LocalId) -> Result<String, LocalError> {
        if id.is_root() {
            return Ok(String::new());
        }
        self.lock()
            .by_id
            .get(&id)
            .map(|(rel, _)| rel.clone())
            .ok_or_else(|| LocalError::NotFound(format!("id {id}")))
    }

    pub(crate) fn lookup_path(&self, rel: &str) -> Option<(LocalId, LocalKind)> {
        if rel.is_empty() {
            return Some((LocalId::ROOT, LocalKind::Folder));
        }
        let index = self.lock();
        let id = *index.by_path.get(rel)?;
        index.by_id.get(&id).map(|(_, kind)| (id, *kind))
    }

    pub(super) fn lookup_id(&self, id: LocalId) -> Option<String> {
        self.lock().by_id.get(&id).map(|(rel, _)| rel.clone())
    }

    pub(super) fn record(&self, id: LocalId, rel: &str, kind: LocalKind) {
        self.lock().insert(id, rel.to_string(), kind);
    }

    pub(super) fn forget(&self, rel: &str) {
        self.lock().remove_subtree(rel);
    }

    pub(super) fn relocate(&self, old: &str, new: &str) {
        self.lock().rebase(old, new);
    }

    /// Id of whatever is at `rel` on disk right now.
    async fn id_at(&self, rel: &str) -> Result<(LocalId, LocalKind), LocalError> {
        let path = self.abs(rel);
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| LocalError::io(&path, e))?;
        Ok((LocalId(meta.ino() as i64), kind_of(&meta)))
    }

    async fn rename_within(&self, id: LocalId, new_rel: String) -> Result<(), LocalError> {
        let old_rel = self.rel_of(id)?;
        if old_rel == new_rel {
            return Ok(());
        }
        let from = self.abs(&old_rel);
        let to = self.abs(&new_rel);
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| LocalError::io(&from, e))?;
        self.relocate(&old_rel, &new_rel);
        Ok(())
    }
}

#[async_trait]
impl LocalStore for FsLocalStore {
    async fn create_folder(&self, parent: LocalId, name: &str) -> Result<LocalId, LocalError> {
        validate_name(name)?;
        let rel = join_rel(&self.rel_of(parent)?, name);
        let path = self.abs(&rel);
        match tokio::fs::create_dir(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && path.is_dir() => {}
            Err(e) => return Err(LocalError::io(&path, e)),
        }
        let (id, kind) = self.id_at(&rel).await?;
        self.record(id, &rel, kind);
        Ok(id)
    }

    async fn rename_folder(&self, id: LocalId, new_name: &str) -> Result<(), LocalError> {
        validate_name(new_name)?;
        let old_rel = self.rel_of(id)?;
        let new_rel = join_rel(parent_rel(&old_rel), new_name);
        self.rename_within(id, new_rel).await
    }

    async fn move_folder(&self, id: LocalId, new_parent: LocalId) -> Result<(), LocalError> {
        let old_rel = self.rel_of(id)?;
        let name = old_rel.rsplit('/').next().unwrap_or(&old_rel).to_string();
        let new_rel = join_rel(&self.rel_of(new_parent)?, &name);
        self.rename_within(id, new_rel).await
    }

    async fn delete_folder(&self, id: LocalId) -> Result<(), LocalError> {
        let rel = self.rel_of(id)?;
        let path = self.abs(&rel);
        tokio::fs::remove_dir_all(&path)
            .await
            .map_err(|e| LocalError::io(&path, e))?;
        self.forget(&rel);
        Ok(())
    }

    async fn delete_file(&self, id: LocalId) -> Result<(), LocalError> {
        let rel = self.rel_of(id)?;
        let path = self.abs(&rel);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| LocalError::io(&path, e))?;
        self.forget(&rel);
        Ok(())
    }

    async fn list_children(&self, id: LocalId) -> Result<Vec<LocalEntry>, LocalError> {
        let dir_rel = self.rel_of(id)?;
        let dir = self.abs(&dir_rel);
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| LocalError::io(&dir, e))?;

        let mut children = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| LocalError::io(&dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.is_hidden(&name) {
                continue;
            }
            let meta = match tokio::fs::symlink_metadata(entry.path()).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "cannot stat, skipping");
                    continue;
                }
            };
            if meta.is_symlink() {
                continue;
            }
            let child = LocalId(meta.ino() as i64);
            let kind = kind_of(&meta);
            self.record(child, &join_rel(&dir_rel, &name), kind);
            children.push(LocalEntry {
                id: child,
                parent: id,
                name,
                kind,
                size: if kind == LocalKind::File { meta.len() } else { 0 },
            });
        }

        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn stat(&self, id: LocalId) -> Result<LocalEntry, LocalError> {
        let rel = self.rel_of(id)?;
        let path = self.abs(&rel);
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| LocalError::io(&path, e))?;
        // The path may have been reused by a different object.
        if !id.is_root() && meta.ino() as i64 != id.0 {
            return Err(LocalError::NotFound(format!("id {id}")));
        }
        let parent = if id.is_root() {
            LocalId::ROOT
        } else {
            self.lookup_path(parent_rel(&rel))
                .map(|(pid, _)| pid)
                .ok_or_else(|| LocalError::NotFound(format!("parent of {rel}")))?
        };
        let kind = kind_of(&meta);
        Ok(LocalEntry {
            id,
            parent,
            name: rel.rsplit('/').next().unwrap_or("").to_string(),
            kind,
            size: if kind == LocalKind::File { meta.len() } else { 0 },
        })
    }

    async fn read_range(&self, id: LocalId, offset: u64, len: u64) -> Result<Vec<u8>, LocalError> {
        let path = self.abs(&self.rel_of(id)?);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| LocalError::io(&path, e))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| LocalError::io(&path, e))?;

        let mut buf = Vec::with_capacity(len as usize);
        file.take(len)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| LocalError::io(&path, e))?;
        Ok(buf)
    }

    async fn fingerprint(&self, id: LocalId) -> Result<String, LocalError> {
        let path = self.abs(&self.rel_of(id)?);
        match tokio::fs::metadata(&path).await {
            Ok(_) => {}
            Err(e) => return Err(LocalError::io(&path, e)),
        }
        hash::content_hash_file(&path)
            .await
            .map_err(|e| LocalError::Io {
                path: path.clone(),
                source: std::io::Error::other(format!("{e:#}")),
            })
    }

    async fn staging_path(&self) -> Result<PathBuf, LocalError> {
        tokio::fs::create_dir_all(&self.staging)
            .await
            .map_err(|e| LocalError::io(&self.staging, e))?;
        let name = format!("{:016x}.part", rand::random::<u64>());
        Ok(self.staging.join(name))
    }

    async fn install_file(
        &self,
        parent: LocalId,
        name: &str,
        staged: &Path,
    ) -> Result<LocalId, LocalError> {
        validate_name(name)?;
        let rel = join_rel(&self.rel_of(parent)?, name);
        let dest = self.abs(&rel);
        tokio::fs::rename(staged, &dest)
            .await
            .map_err(|e| LocalError::io(&dest, e))?;
        let (id, kind) = self.id_at(&rel).await?;
        self.record(id, &rel, kind);
        Ok(id)
    }
}
