//! The remote object store as seen by the sync engine.
//!
//! [`HttpRemote`] talks to the cloud API; the engine only depends on the
//! [`RemoteClient`] trait so transport, auth and envelope parsing stay out of
//! the algorithms.

mod client;
mod files;
mod types;

pub use client::HttpRemote;
pub(crate) use types::TokenResponse;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Typed outcome of a failed remote call.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("server error ({status}): {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The upload session holds a different number of bytes than we sent.
    #[error("incorrect upload offset, remote has {expected} bytes")]
    IncorrectOffset { expected: u64 },
    #[error("api error: {0}")]
    Api(String),
}

impl RemoteError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::RateLimited { .. }
                | RemoteError::ServerError { .. }
                | RemoteError::Network(_)
        )
    }
}

/// Metadata of a file stored remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub path: String,
    pub content_hash: String,
    pub size: u64,
}

/// One entry of a folder listing or change feed page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEntry {
    Folder { id: String, path: String },
    File(RemoteFile),
    /// Deletions do not say whether the entry was a file or a folder.
    Deleted { path: String },
}

impl RemoteEntry {
    pub fn path(&self) -> &str {
        match self {
            RemoteEntry::Folder { path, .. } | RemoteEntry::Deleted { path } => path,
            RemoteEntry::File(f) => &f.path,
        }
    }
}

/// One page of a listing; `cursor` resumes after it.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub entries: Vec<RemoteEntry>,
    pub cursor: String,
    pub has_more: bool,
}

/// Downloaded bytes plus what the remote claims about them.
#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Vec<u8>,
    pub meta: RemoteFile,
}

/// Result of a long-poll wait on a cursor.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PollResult {
    pub changes: bool,
    /// Seconds the server asks us to wait before polling again.
    #[serde(default)]
    pub backoff: Option<u64>,
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn create_folder(&self, path: &str) -> Result<String, RemoteError>;
    async fn move_entry(&self, from: &str, to: &str) -> Result<(), RemoteError>;
    async fn delete(&self, path: &str) -> Result<(), RemoteError>;

    async fn upload_small(&self, path: &str, bytes: Vec<u8>) -> Result<RemoteFile, RemoteError>;
    async fn start_session(&self, first_chunk: Vec<u8>) -> Result<String, RemoteError>;
    async fn append(&self, session_id: &str, chunk: Vec<u8>, offset: u64)
    -> Result<(), RemoteError>;
    async fn finish(
        &self,
        session_id: &str,
        path: &str,
        total_size: u64,
    ) -> Result<RemoteFile, RemoteError>;

    async fn download(&self, path: &str) -> Result<Download, RemoteError>;

    async fn list_folder(&self, path: &str, recursive: bool) -> Result<ListPage, RemoteError>;
    async fn list_folder_continue(&self, cursor: &str) -> Result<ListPage, RemoteError>;
    /// Cursor positioned at "now" without enumerating anything.
    async fn latest_cursor(&self, path: &str) -> Result<String, RemoteError>;
    /// Block until the feed behind `cursor` changes or `timeout` passes.
    async fn longpoll(&self, cursor: &str, timeout: Duration) -> Result<PollResult, RemoteError>;
}
