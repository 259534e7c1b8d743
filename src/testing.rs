//! Test doubles shared by the module tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::remote::{
    Download, ListPage, PollResult, RemoteClient, RemoteEntry, RemoteError, RemoteFile,
};
use crate::util::{hash, path as sync_path};

/// Fresh in-memory database with the schema applied. One connection, since
/// every SQLite memory connection is its own database.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    crate::db::MIGRATOR.run(&pool).await.unwrap();
    pool
}

#[derive(Debug, Clone)]
enum Node {
    Folder { id: String, path: String },
    File { id: String, path: String, bytes: Vec<u8> },
}

impl Node {
    fn entry(&self) -> RemoteEntry {
        match self {
            Node::Folder { id, path } => RemoteEntry::Folder {
                id: id.clone(),
                path: path.clone(),
            },
            Node::File { id, path, bytes } => RemoteEntry::File(file_meta(id, path, bytes)),
        }
    }

    fn path(&self) -> &str {
        match self {
            Node::Folder { path, .. } | Node::File { path, .. } => path,
        }
    }
}

fn file_meta(id: &str, path: &str, bytes: &[u8]) -> RemoteFile {
    RemoteFile {
        id: id.to_string(),
        path: path.to_string(),
        content_hash: hash::content_hash(bytes),
        size: bytes.len() as u64,
    }
}

#[derive(Default)]
struct Inner {
    /// Keyed by lower-cased path.
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<String, Vec<u8>>,
    sessions_opened: usize,
    log: Vec<RemoteEntry>,
    next_id: u64,
    page_size: Option<usize>,
    failing_appends: u32,
    failing_cursors: u32,
    truncate_downloads: bool,
    unauthorized: bool,
    calls: Vec<String>,
}

impl Inner {
    fn fresh_id(&mut self) -> String {
        self.next_id += 1;
        format!("id:{}", self.next_id)
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.unauthorized {
            return Err(RemoteError::Unauthorized("token revoked".into()));
        }
        Ok(())
    }

    fn write_file(&mut self, path: &str, bytes: Vec<u8>) -> RemoteFile {
        let path = sync_path::normalize_remote(path);
        let key = sync_path::path_lower(&path);
        let existing = match self.nodes.get(&key) {
            Some(Node::File { id, .. }) => Some(id.clone()),
            _ => None,
        };
        let id = existing.unwrap_or_else(|| self.fresh_id());
        let meta = file_meta(&id, &path, &bytes);
        self.nodes.insert(key, Node::File { id, path, bytes });
        self.log.push(RemoteEntry::File(meta.clone()));
        meta
    }

    fn subtree_keys(&self, path: &str) -> Vec<String> {
        let key = sync_path::path_lower(path);
        let prefix = format!("{key}/");
        self.nodes
            .keys()
            .filter(|k| **k == key || k.starts_with(&prefix))
            .cloned()
            .collect()
    }
}

/// In-memory remote store with a change log and fault injection.
#[derive(Default)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Seed a file as if another client uploaded it.
    pub fn put_file(&self, path: &str, bytes: &[u8]) -> RemoteFile {
        self.lock().write_file(path, bytes.to_vec())
    }

    pub fn put_folder(&self, path: &str) -> String {
        let mut inner = self.lock();
        let path = sync_path::normalize_remote(path);
        let id = inner.fresh_id();
        inner.nodes.insert(
            sync_path::path_lower(&path),
            Node::Folder {
                id: id.clone(),
                path: path.clone(),
            },
        );
        inner.log.push(RemoteEntry::Folder {
            id: id.clone(),
            path,
        });
        id
    }

    pub fn remove(&self, path: &str) {
        let mut inner = self.lock();
        for key in inner.subtree_keys(path) {
            inner.nodes.remove(&key);
        }
        inner.log.push(RemoteEntry::Deleted {
            path: sync_path::normalize_remote(path),
        });
    }

    pub fn file_bytes(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().nodes.get(&sync_path::path_lower(path)) {
            Some(Node::File { bytes, .. }) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub fn is_folder(&self, path: &str) -> bool {
        matches!(
            self.lock().nodes.get(&sync_path::path_lower(path)),
            Some(Node::Folder { .. })
        )
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock()
            .nodes
            .contains_key(&sync_path::path_lower(path))
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions_opened
    }

    /// Mutating calls made so far, e.g. `"delete /r/a"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn set_page_size(&self, size: usize) {
        self.lock().page_size = Some(size);
    }

    pub fn fail_next_appends(&self, n: u32) {
        self.lock().failing_appends = n;
    }

    pub fn fail_next_cursors(&self, n: u32) {
        self.lock().failing_cursors = n;
    }

    /// Serve downloads one byte short while declaring the full size.
    pub fn truncate_downloads(&self, on: bool) {
        self.lock().truncate_downloads = on;
    }

    pub fn set_unauthorized(&self, on: bool) {
        self.lock().unauthorized = on;
    }
}

fn parse_cursor(cursor: &str) -> Result<usize, RemoteError> {
    cursor
        .strip_prefix("c:")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| RemoteError::Api(format!("bad cursor {cursor}")))
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn create_folder(&self, path: &str) -> Result<String, RemoteError> {
        {
            let mut inner = self.lock();
            inner.check()?;
            inner.calls.push(format!("create_folder {path}"));
            if inner.nodes.contains_key(&sync_path::path_lower(path)) {
                return Err(RemoteError::AlreadyExists(path.to_string()));
            }
        }
        Ok(self.put_folder(path))
    }

    async fn move_entry(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        inner.check()?;
        inner.calls.push(format!("move {from} -> {to}"));
        let keys = inner.subtree_keys(from);
        if keys.is_empty() {
            return Err(RemoteError::NotFound(from.to_string()));
        }
        if inner.nodes.contains_key(&sync_path::path_lower(to)) {
            return Err(RemoteError::AlreadyExists(to.to_string()));
        }
        let from_norm = sync_path::normalize_remote(from);
        for key in keys {
            let Some(node) = inner.nodes.remove(&key) else {
                continue;
            };
            let new_path = sync_path::rebase(node.path(), &from_norm, to);
            let moved = match node {
                Node::Folder { id, .. } => Node::Folder {
                    id,
                    path: new_path.clone(),
                },
                Node::File { id, bytes, .. } => Node::File {
                    id,
                    path: new_path.clone(),
                    bytes,
                },
            };
            inner.log.push(moved.entry());
            inner.nodes.insert(sync_path::path_lower(&new_path), moved);
        }
        inner.log.push(RemoteEntry::Deleted { path: from_norm });
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        {
            let mut inner = self.lock();
            inner.check()?;
            inner.calls.push(format!("delete {path}"));
            if inner.subtree_keys(path).is_empty() {
                return Err(RemoteError::NotFound(path.to_string()));
            }
        }
        self.remove(path);
        Ok(())
    }

    async fn upload_small(&self, path: &str, bytes: Vec<u8>) -> Result<RemoteFile, RemoteError> {
        let mut inner = self.lock();
        inner.check()?;
        inner.calls.push(format!("upload {path}"));
        Ok(inner.write_file(path, bytes))
    }

    async fn start_session(&self, first_chunk: Vec<u8>) -> Result<String, RemoteError> {
        let mut inner = self.lock();
        inner.check()?;
        inner.sessions_opened += 1;
        let id = format!("session:{}", inner.sessions_opened);
        inner.sessions.insert(id.clone(), first_chunk);
        Ok(id)
    }

    async fn append(
        &self,
        session_id: &str,
        chunk: Vec<u8>,
        offset: u64,
    ) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        inner.check()?;
        if inner.failing_appends > 0 {
            inner.failing_appends -= 1;
            return Err(RemoteError::Network("connection reset".into()));
        }
        let buf = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RemoteError::NotFound(session_id.to_string()))?;
        if offset != buf.len() as u64 {
            return Err(RemoteError::IncorrectOffset {
                expected: buf.len() as u64,
            });
        }
        buf.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(
        &self,
        session_id: &str,
        path: &str,
        total_size: u64,
    ) -> Result<RemoteFile, RemoteError> {
        let mut inner = self.lock();
        inner.check()?;
        let len = inner
            .sessions
            .get(session_id)
            .map(|b| b.len() as u64)
            .ok_or_else(|| RemoteError::NotFound(session_id.to_string()))?;
        if len != total_size {
            return Err(RemoteError::IncorrectOffset { expected: len });
        }
        let bytes = inner.sessions.remove(session_id).unwrap_or_default();
        inner.calls.push(format!("upload {path}"));
        Ok(inner.write_file(path, bytes))
    }

    async fn download(&self, path: &str) -> Result<Download, RemoteError> {
        let inner = self.lock();
        inner.check()?;
        match inner.nodes.get(&sync_path::path_lower(path)) {
            Some(Node::File { id, path, bytes }) => {
                let meta = file_meta(id, path, bytes);
                let mut bytes = bytes.clone();
                if inner.truncate_downloads {
                    bytes.pop();
                }
                Ok(Download { bytes, meta })
            }
            _ => Err(RemoteError::NotFound(path.to_string())),
        }
    }

    async fn list_folder(&self, path: &str, recursive: bool) -> Result<ListPage, RemoteError> {
        let inner = self.lock();
        inner.check()?;
        let base = sync_path::path_lower(path);
        let entries = inner
            .nodes
            .iter()
            .filter(|(key, _)| {
                sync_path::is_under(&base, key)
                    && **key != base
                    && (recursive || sync_path::parent(key).as_deref() == Some(base.as_str()))
            })
            .map(|(_, node)| node.entry())
            .collect();
        Ok(ListPage {
            entries,
            cursor: format!("c:{}", inner.log.len()),
            has_more: false,
        })
    }

    async fn list_folder_continue(&self, cursor: &str) -> Result<ListPage, RemoteError> {
        let inner = self.lock();
        inner.check()?;
        let start = parse_cursor(cursor)?.min(inner.log.len());
        let end = match inner.page_size {
            Some(n) => (start + n).min(inner.log.len()),
            None => inner.log.len(),
        };
        Ok(ListPage {
            entries: inner.log[start..end].to_vec(),
            cursor: format!("c:{end}"),
            has_more: end < inner.log.len(),
        })
    }

    async fn latest_cursor(&self, _path: &str) -> Result<String, RemoteError> {
        let mut inner = self.lock();
        inner.check()?;
        if inner.failing_cursors > 0 {
            inner.failing_cursors -= 1;
            return Err(RemoteError::Network("connection refused".into()));
        }
        Ok(format!("c:{}", inner.log.len()))
    }

    async fn longpoll(&self, cursor: &str, _timeout: Duration) -> Result<PollResult, RemoteError> {
        let inner = self.lock();
        Ok(PollResult {
            changes: parse_cursor(cursor)? < inner.log.len(),
            backoff: None,
        })
    }
}
