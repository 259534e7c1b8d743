use serde::{Deserialize, Serialize};

use super::{ListPage, RemoteEntry, RemoteFile};

/// Metadata envelope shared by listings, uploads and downloads. The `.tag`
/// field is only present in listings.
#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    #[serde(rename = ".tag", default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl Metadata {
    fn path(&self) -> String {
        self.path_display
            .clone()
            .or_else(|| self.path_lower.clone())
            .unwrap_or_default()
    }

    pub fn into_file(self) -> RemoteFile {
        let path = self.path();
        RemoteFile {
            id: self.id.unwrap_or_default(),
            path,
            content_hash: self.content_hash.unwrap_or_default(),
            size: self.size.unwrap_or(0),
        }
    }

    /// Convert a listing entry; unknown tags are dropped.
    pub fn into_entry(self) -> Option<RemoteEntry> {
        match self.tag.as_deref() {
            Some("folder") => Some(RemoteEntry::Folder {
                id: self.id.clone().unwrap_or_default(),
                path: self.path(),
            }),
            Some("file") => Some(RemoteEntry::File(self.into_file())),
            Some("deleted") => Some(RemoteEntry::Deleted { path: self.path() }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FolderResult {
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListFolderResult {
    pub entries: Vec<Metadata>,
    pub cursor: String,
    pub has_more: bool,
}

impl From<ListFolderResult> for ListPage {
    fn from(r: ListFolderResult) -> Self {
        ListPage {
            entries: r.entries.into_iter().filter_map(Metadata::into_entry).collect(),
            cursor: r.cursor,
            has_more: r.has_more,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CursorResult {
    pub cursor: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartResult {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct PathArg<'a> {
    pub path: &'a str,
}

#[derive(Debug, Serialize)]
pub struct CreateFolderArg<'a> {
    pub path: &'a str,
    pub autorename: bool,
}

#[derive(Debug, Serialize)]
pub struct MoveArg<'a> {
    pub from_path: &'a str,
    pub to_path: &'a str,
    pub autorename: bool,
}

#[derive(Debug, Serialize)]
pub struct ListFolderArg<'a> {
    pub path: &'a str,
    pub recursive: bool,
    pub include_deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct CursorArg<'a> {
    pub cursor: &'a str,
}

#[derive(Debug, Serialize)]
pub struct LongpollArg<'a> {
    pub cursor: &'a str,
    pub timeout: u64,
}

/// Commit info for uploads: always overwrite so retries are idempotent.
#[derive(Debug, Serialize)]
pub struct CommitInfo<'a> {
    pub path: &'a str,
    pub mode: &'static str,
    pub autorename: bool,
    pub mute: bool,
}

impl<'a> CommitInfo<'a> {
    pub fn overwrite(path: &'a str) -> Self {
        Self {
            path,
            mode: "overwrite",
            autorename: false,
            mute: true,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionStartArg {
    pub close: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionCursor<'a> {
    pub session_id: &'a str,
    pub offset: u64,
}

#[derive(Debug, Serialize)]
pub struct AppendArg<'a> {
    pub cursor: SessionCursor<'a>,
    pub close: bool,
}

#[derive(Debug, Serialize)]
pub struct FinishArg<'a> {
    pub cursor: SessionCursor<'a>,
    pub commit: CommitInfo<'a>,
}

/// Error body returned with HTTP 409.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub error_summary: String,
    #[serde(default)]
    pub error: serde_json::Value,
}

impl ApiErrorBody {
    /// Upload-session errors nest `correct_offset` at varying depths.
    pub fn correct_offset(&self) -> Option<u64> {
        fn find(v: &serde_json::Value) -> Option<u64> {
            match v {
                serde_json::Value::Object(map) => map
                    .get("correct_offset")
                    .and_then(|o| o.as_u64())
                    .or_else(|| map.values().find_map(find)),
                _ => None,
            }
        }
        find(&self.error)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_entries_map_by_tag() {
        let body = r#"{
            "entries": [
                {".tag": "folder", "id": "id:1", "path_display": "/Root/Docs", "path_lower": "/root/docs"},
                {".tag": "file", "id": "id:2", "path_display": "/Root/Docs/a.txt",
                 "content_hash": "abc", "size": 12},
                {".tag": "deleted", "path_lower": "/root/old.txt"},
                {".tag": "symlink", "path_lower": "/root/link"}
            ],
            "cursor": "c1",
            "has_more": true
        }"#;
        let result: ListFolderResult = serde_json::from_str(body).unwrap();
        let page = ListPage::from(result);

        assert_eq!(page.entries.len(), 3);
        assert!(matches!(&page.entries[0], RemoteEntry::Folder { path, .. } if path == "/Root/Docs"));
        assert!(matches!(&page.entries[1], RemoteEntry::File(f) if f.size == 12 && f.content_hash == "abc"));
        assert!(matches!(&page.entries[2], RemoteEntry::Deleted { path } if path == "/root/old.txt"));
        assert!(page.has_more);
    }

    #[test]
    fn correct_offset_found_when_nested() {
        let body = r#"{
            "error_summary": "lookup_failed/incorrect_offset/..",
            "error": {".tag": "lookup_failed", "lookup_failed": {".tag": "incorrect_offset", "correct_offset": 4096}}
        }"#;
        let err: ApiErrorBody = serde_json::from_str(body).unwrap();
        assert_eq!(err.correct_offset(), Some(4096));
    }
}
