//! The local folder tree as seen by the sync engine.

mod fs;
pub mod watcher;

pub use fs::FsLocalStore;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque, stable identifier of a local folder or file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub i64);

impl LocalId {
    /// Sentinel for the synchronized root folder.
    pub const ROOT: LocalId = LocalId(0);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalKind {
    Folder,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub id: LocalId,
    pub parent: LocalId,
    pub name: String,
    pub kind: LocalKind,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum LocalError {
    #[error("local entry {0} not found")]
    NotFound(String),
    #[error("invalid local name: {0}")]
    InvalidName(String),
    #[error("local I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LocalError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            LocalError::NotFound(path.display().to_string())
        } else {
            LocalError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn create_folder(&self, parent: LocalId, name: &str) -> Result<LocalId, LocalError>;
    async fn rename_folder(&self, id: LocalId, new_name: &str) -> Result<(), LocalError>;
    async fn move_folder(&self, id: LocalId, new_parent: LocalId) -> Result<(), LocalError>;
    async fn delete_folder(&self, id: LocalId) -> Result<(), LocalError>;
    async fn delete_file(&self, id: LocalId) -> Result<(), LocalError>;

    async fn list_children(&self, id: LocalId) -> Result<Vec<LocalEntry>, LocalError>;
    async fn stat(&self, id: LocalId) -> Result<LocalEntry, LocalError>;

    /// Read up to `len` bytes starting at `offset`.
    async fn read_range(&self, id: LocalId, offset: u64, len: u64) -> Result<Vec<u8>, LocalError>;
    /// Content fingerprint of a file (see [`crate::util::hash`]).
    async fn fingerprint(&self, id: LocalId) -> Result<String, LocalError>;

    /// Fresh path for a download in progress; never visible to the sync.
    async fn staging_path(&self) -> Result<PathBuf, LocalError>;
    /// Atomically move a verified staged file to `parent/name`, replacing
    /// whatever is there. Returns the id of the installed file.
    async fn install_file(
        &self,
        parent: LocalId,
        name: &str,
        staged: &Path,
    ) -> Result<LocalId, LocalError>;
}

/// Typed callbacks for local mutations.
#[async_trait]
pub trait LocalObserver: Send + Sync {
    async fn on_folder_created(&self, id: LocalId, parent: LocalId, name: &str);
    async fn on_folder_renamed(&self, id: LocalId, parent: LocalId, new_name: &str);
    async fn on_folder_moved(&self, id: LocalId, new_parent: LocalId, name: &str);
    async fn on_folder_deleted(&self, id: LocalId);
    async fn on_file_added(&self, id: LocalId, parent: LocalId, name: &str);
    async fn on_file_updated(&self, id: LocalId, parent: LocalId, name: &str);
    async fn on_file_moved(&self, id: LocalId, new_parent: LocalId, name: &str);
    async fn on_file_deleted(&self, id: LocalId);
}
