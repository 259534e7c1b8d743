use std::time::Duration;

use async_trait::async_trait;

use super::client::{HttpRemote, NOTIFY_BASE, classify_conflict, decode};
use super::types::{
    AppendArg, CommitInfo, CreateFolderArg, CursorArg, CursorResult, FinishArg, FolderResult,
    ListFolderArg, ListFolderResult, LongpollArg, Metadata, MoveArg, PathArg, SessionCursor,
    SessionStartArg, SessionStartResult,
};
use super::{Download, ListPage, PollResult, RemoteClient, RemoteError, RemoteFile};

#[async_trait]
impl RemoteClient for HttpRemote {
    async fn create_folder(&self, path: &str) -> Result<String, RemoteError> {
        let resp = self
            .rpc("/files/create_folder_v2")
            .json(&CreateFolderArg {
                path,
                autorename: false,
            })?
            .send()
            .await?;
        let result: FolderResult = decode(resp).await?;
        Ok(result.metadata.id.unwrap_or_default())
    }

    async fn move_entry(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.rpc("/files/move_v2")
            .json(&MoveArg {
                from_path: from,
                to_path: to,
                autorename: false,
            })?
            .send()
            .await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        self.rpc("/files/delete_v2")
            .json(&PathArg { path })?
            .send()
            .await?;
        Ok(())
    }

    async fn upload_small(&self, path: &str, bytes: Vec<u8>) -> Result<RemoteFile, RemoteError> {
        let resp = self
            .content("/files/upload")
            .arg(&CommitInfo::overwrite(path))?
            .body(bytes)
            .send()
            .await?;
        let meta: Metadata = decode(resp).await?;
        Ok(meta.into_file())
    }

    async fn start_session(&self, first_chunk: Vec<u8>) -> Result<String, RemoteError> {
        let resp = self
            .content("/files/upload_session/start")
            .arg(&SessionStartArg { close: false })?
            .body(first_chunk)
            .send()
            .await?;
        let result: SessionStartResult = decode(resp).await?;
        Ok(result.session_id)
    }

    async fn append(
        &self,
        session_id: &str,
        chunk: Vec<u8>,
        offset: u64,
    ) -> Result<(), RemoteError> {
        self.content("/files/upload_session/append_v2")
            .arg(&AppendArg {
                cursor: SessionCursor { session_id, offset },
                close: false,
            })?
            .body(chunk)
            .send()
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        session_id: &str,
        path: &str,
        total_size: u64,
    ) -> Result<RemoteFile, RemoteError> {
        let resp = self
            .content("/files/upload_session/finish")
            .arg(&FinishArg {
                cursor: SessionCursor {
                    session_id,
                    offset: total_size,
                },
                commit: CommitInfo::overwrite(path),
            })?
            .body(Vec::new())
            .send()
            .await?;
        let meta: Metadata = decode(resp).await?;
        Ok(meta.into_file())
    }

    async fn download(&self, path: &str) -> Result<Download, RemoteError> {
        let resp = self
            .content("/files/download")
            .arg(&PathArg { path })?
            .send()
            .await?;

        let header = resp
            .headers()
            .get("dropbox-api-result")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RemoteError::Api("download response without metadata".into()))?;
        let meta: Metadata = serde_json::from_str(header)
            .map_err(|e| RemoteError::Api(format!("download metadata: {e}")))?;

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RemoteError::Network(format!("download body: {e}")))?;

        Ok(Download {
            bytes: bytes.to_vec(),
            meta: meta.into_file(),
        })
    }

    async fn list_folder(&self, path: &str, recursive: bool) -> Result<ListPage, RemoteError> {
        let resp = self
            .rpc("/files/list_folder")
            .json(&ListFolderArg {
                path,
                recursive,
                include_deleted: false,
            })?
            .send()
            .await?;
        let result: ListFolderResult = decode(resp).await?;
        Ok(result.into())
    }

    async fn list_folder_continue(&self, cursor: &str) -> Result<ListPage, RemoteError> {
        let resp = self
            .rpc("/files/list_folder/continue")
            .json(&CursorArg { cursor })?
            .send()
            .await?;
        let result: ListFolderResult = decode(resp).await?;
        Ok(result.into())
    }

    async fn latest_cursor(&self, path: &str) -> Result<String, RemoteError> {
        let resp = self
            .rpc("/files/list_folder/get_latest_cursor")
            .json(&ListFolderArg {
                path,
                recursive: true,
                include_deleted: true,
            })?
            .send()
            .await?;
        let result: CursorResult = decode(resp).await?;
        Ok(result.cursor)
    }

    /// The notify endpoint takes no auth and holds the connection open, so
    /// it gets its own client with a timeout past the poll window.
    async fn longpoll(&self, cursor: &str, timeout: Duration) -> Result<PollResult, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(timeout + Duration::from_secs(90))
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let resp = http
            .post(format!("{NOTIFY_BASE}/files/list_folder/longpoll"))
            .json(&LongpollArg {
                cursor,
                timeout: timeout.as_secs().clamp(30, 480),
            })
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(RemoteError::ServerError {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_conflict(&body));
        }
        decode(resp).await
    }
}
