//! Task payloads as stored in the `payload` column.

use serde::{Deserialize, Serialize};

use crate::local::LocalId;

/// Remote-to-local folder create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Remote-to-local file create or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Remote-to-local delete of a mapped entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDelete {
    pub path: String,
    pub local_id: LocalId,
}

/// Local-to-remote create, rename, move or update: where the entry lives
/// now. Both fields are required; they are optional here so a missing one
/// is reported as an invalid task rather than a decode error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPlacement {
    #[serde(default)]
    pub parent_id: Option<LocalId>,
    #[serde(default)]
    pub name: Option<String>,
}

impl LocalPlacement {
    pub fn new(parent_id: LocalId, name: &str) -> Self {
        Self {
            parent_id: Some(parent_id),
            name: Some(name.to_string()),
        }
    }
}
