//! Byte movement between the local tree and the remote store.
//!
//! Uploads up to `inline_threshold` go in one request. Larger files use an
//! upload session: start with the first chunk, append the rest at explicit
//! offsets, finish with the total size. Chunks are read from the local store
//! by range, so memory stays bounded by the chunk size. Every step retries
//! on its own with exponential backoff.
//!
//! Downloads land in a staging file, are checked against the size and
//! content fingerprint the remote declared, and only then renamed into
//! place.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::TransferConfig;
use crate::error::{Result, SyncError};
use crate::local::{LocalError, LocalId, LocalStore};
use crate::remote::{RemoteClient, RemoteError, RemoteFile};
use crate::util::hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    SessionStarted,
    Appending,
    Finished,
    Aborted,
}

pub struct TransferEngine {
    remote: Arc<dyn RemoteClient>,
    local: Arc<dyn LocalStore>,
    config: TransferConfig,
}

/// A verified download installed in the local tree.
#[derive(Debug, Clone)]
pub struct Installed {
    pub local_id: LocalId,
    pub meta: RemoteFile,
}

impl TransferEngine {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        local: Arc<dyn LocalStore>,
        config: TransferConfig,
    ) -> Self {
        Self {
            remote,
            local,
            config,
        }
    }

    /// Upload local file `id` to `remote_path`, overwriting what is there.
    pub async fn upload(&self, id: LocalId, remote_path: &str) -> Result<RemoteFile> {
        let size = self.local.stat(id).await?.size;

        if size <= self.config.inline_threshold {
            let bytes = self.local.read_range(id, 0, size).await?;
            let meta = self
                .with_retry("upload", || self.remote.upload_small(remote_path, bytes.clone()))
                .await?;
            tracing::info!(path = remote_path, size, "uploaded");
            return Ok(meta);
        }

        self.upload_chunked(id, remote_path, size).await
    }

    async fn upload_chunked(&self, id: LocalId, remote_path: &str, size: u64) -> Result<RemoteFile> {
        let chunk_size = self.config.chunk_size;
        let mut state = TransferState::Idle;

        let first = self.local.read_range(id, 0, chunk_size.min(size)).await?;
        let mut offset = first.len() as u64;
        let session = match self
            .with_retry("session start", || self.remote.start_session(first.clone()))
            .await
        {
            Ok(s) => s,
            Err(e) => return Err(abort(remote_path, state, e.into())),
        };
        state = TransferState::SessionStarted;
        tracing::debug!(path = remote_path, session = %session, ?state, "upload session open");

        let mut attempt = 0;
        while offset < size {
            let chunk = self.local.read_range(id, offset, chunk_size).await?;
            if chunk.is_empty() {
                let err = SyncError::Integrity {
                    path: remote_path.to_string(),
                    reason: format!("file shrank to {offset} bytes during upload"),
                };
                return Err(abort(remote_path, state, err));
            }
            let len = chunk.len() as u64;

            match self.remote.append(&session, chunk, offset).await {
                Ok(()) => {
                    offset += len;
                    attempt = 0;
                    state = TransferState::Appending;
                    tracing::trace!(path = remote_path, offset, size, "chunk appended");
                }
                Err(RemoteError::IncorrectOffset { expected })
                    if expected <= size && attempt + 1 < self.config.max_attempts =>
                {
                    tracing::warn!(
                        path = remote_path,
                        sent = offset,
                        expected,
                        "remote offset differs, resending from its position"
                    );
                    offset = expected;
                    attempt += 1;
                }
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_attempts => {
                    let wait = self.backoff(attempt, &e);
                    tracing::warn!(
                        path = remote_path,
                        offset,
                        attempt = attempt + 1,
                        error = %e,
                        "append failed, retrying in {wait:?}"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(abort(remote_path, state, e.into())),
            }
        }

        let meta = match self
            .with_retry("session finish", || {
                self.remote.finish(&session, remote_path, size)
            })
            .await
        {
            Ok(m) => m,
            Err(e) => return Err(abort(remote_path, state, e.into())),
        };
        state = TransferState::Finished;
        tracing::info!(path = remote_path, size, ?state, "uploaded in chunks");
        Ok(meta)
    }

    /// Download `remote_path` into `parent/name`. Nothing is installed
    /// unless the bytes match the declared size and fingerprint.
    pub async fn download(
        &self,
        remote_path: &str,
        parent: LocalId,
        name: &str,
    ) -> Result<Installed> {
        let dl = self
            .with_retry("download", || self.remote.download(remote_path))
            .await?;

        let staged = self.local.staging_path().await?;
        tokio::fs::write(&staged, &dl.bytes)
            .await
            .map_err(|e| LocalError::io(&staged, e))?;
        drop(dl.bytes);

        if let Err(e) = verify(&staged, &dl.meta).await {
            discard(&staged).await;
            return Err(e);
        }

        match self.local.install_file(parent, name, &staged).await {
            Ok(local_id) => {
                tracing::info!(path = remote_path, size = dl.meta.size, "downloaded");
                Ok(Installed {
                    local_id,
                    meta: dl.meta,
                })
            }
            Err(e) => {
                discard(&staged).await;
                Err(e.into())
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, step: &str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_attempts => {
                    let wait = self.backoff(attempt, &e);
                    tracing::warn!(
                        step,
                        attempt = attempt + 1,
                        error = %e,
                        "transfer step failed, retrying in {wait:?}"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, attempt: u32, err: &RemoteError) -> Duration {
        if let RemoteError::RateLimited {
            retry_after: Some(wait),
        } = err
        {
            return *wait;
        }
        self.config.initial_backoff() * 2u32.saturating_pow(attempt)
    }
}

fn abort(path: &str, from: TransferState, err: SyncError) -> SyncError {
    tracing::warn!(path, ?from, state = ?TransferState::Aborted, error = %err, "upload aborted");
    err
}

async fn verify(staged: &Path, declared: &RemoteFile) -> Result<()> {
    let size = tokio::fs::metadata(staged)
        .await
        .map_err(|e| LocalError::io(staged, e))?
        .len();
    if size != declared.size {
        return Err(SyncError::Integrity {
            path: declared.path.clone(),
            reason: format!("got {size} bytes, expected {}", declared.size),
        });
    }

    if !declared.content_hash.is_empty() {
        let actual = hash::content_hash_file(staged)
            .await
            .map_err(|e| LocalError::Io {
                path: staged.to_path_buf(),
                source: std::io::Error::other(format!("{e:#}")),
            })?;
        if actual != declared.content_hash {
            return Err(SyncError::Integrity {
                path: declared.path.clone(),
                reason: format!(
                    "content hash {actual} does not match {}",
                    declared.content_hash
                ),
            });
        }
    }
    Ok(())
}

async fn discard(staged: &Path) {
    if let Err(e) = tokio::fs::remove_file(staged).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %staged.display(), error = %e, "failed to remove staged download");
    }
}
