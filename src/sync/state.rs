//! Mapping store: which local folder/file corresponds to which remote path,
//! plus the change-feed cursor.
//!
//! Remote paths are compared case-insensitively; every row carries the
//! lower-cased path and its sha1 digest, and lookups go through the digest.
//! The synchronized root folder ([`LocalId::ROOT`]) is never stored; it maps
//! to the configured remote root.

use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::local::LocalId;
use crate::util::path::{self as sync_path, path_hash, path_lower};

/// Timestamps are stored as fixed-width RFC 3339 strings so they sort
/// lexically.
pub(crate) fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderMapping {
    pub local_folder_id: LocalId,
    pub remote_path: String,
    pub fingerprint: String,
    pub last_synced_at: String,
}

impl FolderMapping {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            local_folder_id: LocalId(row.get("local_folder_id")),
            remote_path: row.get("remote_path"),
            fingerprint: row.get("fingerprint"),
            last_synced_at: row.get("last_synced_at"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapping {
    pub local_file_id: LocalId,
    pub remote_path: String,
    pub remote_object_id: String,
    pub content_fingerprint: String,
    pub last_synced_at: String,
}

impl FileMapping {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            local_file_id: LocalId(row.get("local_file_id")),
            remote_path: row.get("remote_path"),
            remote_object_id: row
                .get::<Option<String>, _>("remote_object_id")
                .unwrap_or_default(),
            content_fingerprint: row.get("content_fingerprint"),
            last_synced_at: row.get("last_synced_at"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub root_path: String,
    pub cursor: String,
    pub has_more: bool,
}

// ── folders ─────────────────────────────────────────────────────────

pub async fn folder_by_local(pool: &SqlitePool, id: LocalId) -> Result<Option<FolderMapping>> {
    let row = sqlx::query("SELECT * FROM folder_mappings WHERE local_folder_id = ?")
        .bind(id.0)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(FolderMapping::from_row))
}

pub async fn folder_by_path(pool: &SqlitePool, remote_path: &str) -> Result<Option<FolderMapping>> {
    let row = sqlx::query("SELECT * FROM folder_mappings WHERE path_hash = ?")
        .bind(path_hash(remote_path))
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(FolderMapping::from_row))
}

/// Remote path of a local folder, treating the root sentinel specially.
pub async fn folder_remote_path(
    pool: &SqlitePool,
    remote_root: &str,
    id: LocalId,
) -> Result<Option<String>> {
    if id.is_root() {
        return Ok(Some(remote_root.to_string()));
    }
    Ok(folder_by_local(pool, id).await?.map(|m| m.remote_path))
}

/// Local id of the folder at `remote_path`, treating the remote root
/// specially.
pub async fn folder_local_id(
    pool: &SqlitePool,
    remote_root: &str,
    remote_path: &str,
) -> Result<Option<LocalId>> {
    if path_lower(remote_path) == path_lower(remote_root) {
        return Ok(Some(LocalId::ROOT));
    }
    Ok(folder_by_path(pool, remote_path)
        .await?
        .map(|m| m.local_folder_id))
}

/// Insert or replace the mapping for a folder. A stale row holding the same
/// remote path under another local id is dropped first.
pub async fn upsert_folder(
    pool: &SqlitePool,
    id: LocalId,
    remote_path: &str,
    fingerprint: &str,
) -> Result<()> {
    let remote_path = sync_path::normalize_remote(remote_path);
    let hash = path_hash(&remote_path);
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM folder_mappings WHERE path_hash = ? AND local_folder_id <> ?")
        .bind(&hash)
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"INSERT INTO folder_mappings (
            local_folder_id, remote_path, path_lower, path_hash, fingerprint, last_synced_at
        ) VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(local_folder_id) DO UPDATE SET
            remote_path = excluded.remote_path,
            path_lower = excluded.path_lower,
            path_hash = excluded.path_hash,
            fingerprint = excluded.fingerprint,
            last_synced_at = excluded.last_synced_at"#,
    )
    .bind(id.0)
    .bind(&remote_path)
    .bind(path_lower(&remote_path))
    .bind(&hash)
    .bind(fingerprint)
    .bind(now_ts())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Point a folder at a new remote path and rewrite every descendant folder
/// and file mapping in the same transaction. Returns the number of rows
/// touched, the folder itself included.
pub async fn relocate_folder(
    pool: &SqlitePool,
    id: LocalId,
    new_path: &str,
    fingerprint: &str,
) -> Result<u64> {
    let new_path = sync_path::normalize_remote(new_path);
    let mut tx = pool.begin().await?;

    let old_path: Option<String> =
        sqlx::query_scalar("SELECT remote_path FROM folder_mappings WHERE local_folder_id = ?")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?;
    let Some(old_path) = old_path else {
        return Err(crate::error::SyncError::MappingMissing(format!(
            "folder {id}"
        )));
    };

    let now = now_ts();
    sqlx::query(
        r#"UPDATE folder_mappings
        SET remote_path = ?, path_lower = ?, path_hash = ?, fingerprint = ?, last_synced_at = ?
        WHERE local_folder_id = ?"#,
    )
    .bind(&new_path)
    .bind(path_lower(&new_path))
    .bind(path_hash(&new_path))
    .bind(fingerprint)
    .bind(&now)
    .bind(id.0)
    .execute(&mut *tx)
    .await?;
    let mut touched = 1;

    let prefix = format!("{}/", path_lower(&old_path));
    for table in ["folder_mappings", "file_mappings"] {
        let key = if table == "folder_mappings" {
            "local_folder_id"
        } else {
            "local_file_id"
        };
        let rows = sqlx::query(&format!(
            "SELECT {key} AS id, remote_path FROM {table} \
             WHERE substr(path_lower, 1, length(?1)) = ?1"
        ))
        .bind(&prefix)
        .fetch_all(&mut *tx)
        .await?;

        for row in rows {
            let child: i64 = row.get("id");
            let child_path: String = row.get("remote_path");
            let rewritten = sync_path::rebase(&child_path, &old_path, &new_path);
            sqlx::query(&format!(
                "UPDATE {table} SET remote_path = ?, path_lower = ?, path_hash = ?, \
                 last_synced_at = ? WHERE {key} = ?"
            ))
            .bind(&rewritten)
            .bind(path_lower(&rewritten))
            .bind(path_hash(&rewritten))
            .bind(&now)
            .bind(child)
            .execute(&mut *tx)
            .await?;
            touched += 1;
        }
    }

    tx.commit().await?;
    tracing::debug!(from = %old_path, to = %new_path, rows = touched, "folder mapping relocated");
    Ok(touched)
}

/// Delete the folder mapping at `remote_path` and every folder and file
/// mapping below it. Returns the number of rows removed.
pub async fn delete_folder_tree(pool: &SqlitePool, remote_path: &str) -> Result<u64> {
    let prefix = format!("{}/", path_lower(remote_path));
    let mut tx = pool.begin().await?;

    let folders = sqlx::query(
        "DELETE FROM folder_mappings WHERE path_hash = ?1 OR substr(path_lower, 1, length(?2)) = ?2",
    )
    .bind(path_hash(remote_path))
    .bind(&prefix)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let files =
        sqlx::query("DELETE FROM file_mappings WHERE substr(path_lower, 1, length(?1)) = ?1")
            .bind(&prefix)
            .execute(&mut *tx)
            .await?
            .rows_affected();

    tx.commit().await?;
    Ok(folders + files)
}

// ── files ───────────────────────────────────────────────────────────

pub async fn file_by_local(pool: &SqlitePool, id: LocalId) -> Result<Option<FileMapping>> {
    let row = sqlx::query("SELECT * FROM file_mappings WHERE local_file_id = ?")
        .bind(id.0)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(FileMapping::from_row))
}

pub async fn file_by_path(pool: &SqlitePool, remote_path: &str) -> Result<Option<FileMapping>> {
    let row = sqlx::query("SELECT * FROM file_mappings WHERE path_hash = ?")
        .bind(path_hash(remote_path))
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(FileMapping::from_row))
}

/// Record a successful transfer. Rows that still claim the same remote path
/// or remote object under another local id are stale and dropped.
pub async fn upsert_file(
    pool: &SqlitePool,
    id: LocalId,
    remote_path: &str,
    remote_object_id: &str,
    content_fingerprint: &str,
) -> Result<()> {
    let remote_path = sync_path::normalize_remote(remote_path);
    let hash = path_hash(&remote_path);
    // Entries pushed without an id are stored as NULL so they never collide.
    let object_id = (!remote_object_id.is_empty()).then_some(remote_object_id);
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"DELETE FROM file_mappings
        WHERE (path_hash = ?1 OR (?2 IS NOT NULL AND remote_object_id = ?2))
          AND local_file_id <> ?3"#,
    )
    .bind(&hash)
    .bind(object_id)
    .bind(id.0)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"INSERT INTO file_mappings (
            local_file_id, remote_path, path_lower, path_hash,
            remote_object_id, content_fingerprint, last_synced_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(local_file_id) DO UPDATE SET
            remote_path = excluded.remote_path,
            path_lower = excluded.path_lower,
            path_hash = excluded.path_hash,
            remote_object_id = excluded.remote_object_id,
            content_fingerprint = excluded.content_fingerprint,
            last_synced_at = excluded.last_synced_at"#,
    )
    .bind(id.0)
    .bind(&remote_path)
    .bind(path_lower(&remote_path))
    .bind(&hash)
    .bind(object_id)
    .bind(content_fingerprint)
    .bind(now_ts())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Both sides already hold this content; only the baseline moves.
pub async fn set_file_fingerprint(
    pool: &SqlitePool,
    id: LocalId,
    content_fingerprint: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE file_mappings SET content_fingerprint = ?, last_synced_at = ? WHERE local_file_id = ?",
    )
    .bind(content_fingerprint)
    .bind(now_ts())
    .bind(id.0)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_file_path(pool: &SqlitePool, id: LocalId, remote_path: &str) -> Result<()> {
    let remote_path = sync_path::normalize_remote(remote_path);
    sqlx::query(
        r#"UPDATE file_mappings
        SET remote_path = ?, path_lower = ?, path_hash = ?, last_synced_at = ?
        WHERE local_file_id = ?"#,
    )
    .bind(&remote_path)
    .bind(path_lower(&remote_path))
    .bind(path_hash(&remote_path))
    .bind(now_ts())
    .bind(id.0)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_file(pool: &SqlitePool, id: LocalId) -> Result<bool> {
    let result = sqlx::query("DELETE FROM file_mappings WHERE local_file_id = ?")
        .bind(id.0)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ── cursor ──────────────────────────────────────────────────────────

pub async fn get_cursor(pool: &SqlitePool, root_path: &str) -> Result<Option<Cursor>> {
    let row = sqlx::query("SELECT cursor, has_more FROM cursors WHERE root_path = ?")
        .bind(root_path)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| Cursor {
        root_path: root_path.to_string(),
        cursor: r.get("cursor"),
        has_more: r.get::<i64, _>("has_more") != 0,
    }))
}

pub async fn set_cursor(
    pool: &SqlitePool,
    root_path: &str,
    cursor: &str,
    has_more: bool,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO cursors (root_path, cursor, has_more, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(root_path) DO UPDATE SET
            cursor = excluded.cursor,
            has_more = excluded.has_more,
            updated_at = excluded.updated_at"#,
    )
    .bind(root_path)
    .bind(cursor)
    .bind(has_more as i64)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(())
}

/// (folder rows, file rows), for the status report.
pub async fn mapping_counts(pool: &SqlitePool) -> Result<(i64, i64)> {
    let folders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM folder_mappings")
        .fetch_one(pool)
        .await?;
    let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_mappings")
        .fetch_one(pool)
        .await?;
    Ok((folders, files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::memory_pool;

    #[tokio::test]
    async fn folder_lookup_is_case_insensitive() {
        let pool = memory_pool().await;
        upsert_folder(&pool, LocalId(7), "/Root/Docs", "f1").await.unwrap();

        let m = folder_by_path(&pool, "/root/docs").await.unwrap().unwrap();
        assert_eq!(m.local_folder_id, LocalId(7));
        assert_eq!(m.remote_path, "/Root/Docs");
        assert_eq!(
            folder_local_id(&pool, "/Root", "/ROOT").await.unwrap(),
            Some(LocalId::ROOT)
        );
    }

    #[tokio::test]
    async fn upsert_replaces_stale_row_for_same_path() {
        let pool = memory_pool().await;
        upsert_file(&pool, LocalId(1), "/r/a.txt", "id:a", "h1").await.unwrap();
        upsert_file(&pool, LocalId(2), "/r/a.txt", "id:a", "h2").await.unwrap();

        assert!(file_by_local(&pool, LocalId(1)).await.unwrap().is_none());
        let m = file_by_path(&pool, "/r/a.txt").await.unwrap().unwrap();
        assert_eq!(m.local_file_id, LocalId(2));
        assert_eq!(m.content_fingerprint, "h2");
    }

    #[tokio::test]
    async fn files_without_remote_id_do_not_collide() {
        let pool = memory_pool().await;
        upsert_file(&pool, LocalId(1), "/r/a.txt", "", "h1").await.unwrap();
        upsert_file(&pool, LocalId(2), "/r/b.txt", "", "h2").await.unwrap();

        assert_eq!(mapping_counts(&pool).await.unwrap(), (0, 2));
        let m = file_by_local(&pool, LocalId(1)).await.unwrap().unwrap();
        assert_eq!(m.remote_object_id, "");
        assert_eq!(m.remote_path, "/r/a.txt");
    }

    #[tokio::test]
    async fn relocation_rewrites_descendants() {
        let pool = memory_pool().await;
        upsert_folder(&pool, LocalId(1), "/r/a", "").await.unwrap();
        upsert_folder(&pool, LocalId(2), "/r/a/b", "").await.unwrap();
        upsert_folder(&pool, LocalId(3), "/r/ab", "").await.unwrap();
        upsert_file(&pool, LocalId(4), "/r/a/b/c.txt", "id:c", "h").await.unwrap();

        let touched = relocate_folder(&pool, LocalId(1), "/r/z", "").await.unwrap();
        assert_eq!(touched, 3);

        assert_eq!(
            folder_by_local(&pool, LocalId(2)).await.unwrap().unwrap().remote_path,
            "/r/z/b"
        );
        assert_eq!(
            file_by_local(&pool, LocalId(4)).await.unwrap().unwrap().remote_path,
            "/r/z/b/c.txt"
        );
        // Sibling sharing a name prefix is untouched.
        assert_eq!(
            folder_by_local(&pool, LocalId(3)).await.unwrap().unwrap().remote_path,
            "/r/ab"
        );
    }

    #[tokio::test]
    async fn deleting_a_folder_cascades_by_prefix() {
        let pool = memory_pool().await;
        upsert_folder(&pool, LocalId(1), "/r/a", "").await.unwrap();
        upsert_folder(&pool, LocalId(2), "/r/a/b", "").await.unwrap();
        upsert_folder(&pool, LocalId(3), "/r/ab", "").await.unwrap();
        upsert_file(&pool, LocalId(4), "/r/a/b/c.txt", "id:c", "h").await.unwrap();

        assert_eq!(delete_folder_tree(&pool, "/r/A").await.unwrap(), 3);
        assert_eq!(mapping_counts(&pool).await.unwrap(), (1, 0));
    }

    #[tokio::test]
    async fn cursor_upserts() {
        let pool = memory_pool().await;
        assert!(get_cursor(&pool, "/r").await.unwrap().is_none());
        set_cursor(&pool, "/r", "c1", true).await.unwrap();
        set_cursor(&pool, "/r", "c2", false).await.unwrap();
        let c = get_cursor(&pool, "/r").await.unwrap().unwrap();
        assert_eq!(c.cursor, "c2");
        assert!(!c.has_more);
    }
}
