//! Mutual exclusion between workers, backed by the `leases` table.
//!
//! A lease older than its ttl is stale and may be broken. Breaking waits a
//! grace interval and then swaps the row only if `acquired_at` still holds
//! the value that was observed, so two acquirers racing on the same stale
//! lease cannot both win.

use std::time::Duration;

use sqlx::{Row, SqlitePool};

use crate::config::LeaseConfig;
use crate::error::Result;

pub const GLOBAL_SCOPE: &str = "global";

/// Worker 0 serializes against everyone; other workers get their own scope.
pub fn worker_scope(worker_id: i64) -> String {
    if worker_id == 0 {
        GLOBAL_SCOPE.to_string()
    } else {
        format!("worker:{worker_id}")
    }
}

#[derive(Clone)]
pub struct LeaseManager {
    pool: SqlitePool,
    config: LeaseConfig,
    owner: String,
}

impl LeaseManager {
    pub fn new(pool: SqlitePool, config: LeaseConfig) -> Self {
        let owner = format!("{}:{:08x}", std::process::id(), rand::random::<u32>());
        Self {
            pool,
            config,
            owner,
        }
    }

    /// Acquire `scope` with the configured ttl.
    pub async fn acquire(&self, scope: &str) -> Result<bool> {
        self.try_acquire(scope, self.config.ttl).await
    }

    pub async fn try_acquire(&self, scope: &str, ttl: Duration) -> Result<bool> {
        let ttl_ms = ttl.as_millis().min(i64::MAX as u128) as i64;

        let inserted = sqlx::query(
            r#"INSERT INTO leases (scope, owner, acquired_at, ttl_ms)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(scope) DO NOTHING"#,
        )
        .bind(scope)
        .bind(&self.owner)
        .bind(now_ms())
        .bind(ttl_ms)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;
        if inserted {
            tracing::trace!(scope, owner = %self.owner, "lease acquired");
            return Ok(true);
        }

        let Some(row) = sqlx::query("SELECT owner, acquired_at, ttl_ms FROM leases WHERE scope = ?")
            .bind(scope)
            .fetch_optional(&self.pool)
            .await?
        else {
            // Released between the insert and the read; the next cycle will
            // get it.
            return Ok(false);
        };
        let holder: String = row.get("owner");
        let acquired_at: i64 = row.get("acquired_at");
        let held_ttl: i64 = row.get("ttl_ms");

        let age = now_ms().saturating_sub(acquired_at);
        if age <= held_ttl {
            tracing::trace!(scope, holder = %holder, "lease busy");
            return Ok(false);
        }

        tracing::warn!(
            scope,
            holder = %holder,
            age_ms = age,
            "breaking stale lease"
        );
        tokio::time::sleep(self.config.grace).await;

        let broken = sqlx::query(
            r#"UPDATE leases SET owner = ?, acquired_at = ?, ttl_ms = ?
            WHERE scope = ? AND acquired_at = ? AND owner = ?"#,
        )
        .bind(&self.owner)
        .bind(now_ms())
        .bind(ttl_ms)
        .bind(scope)
        .bind(acquired_at)
        .bind(&holder)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if !broken {
            tracing::debug!(scope, "stale lease taken over by someone else");
        }
        Ok(broken)
    }

    /// Clear the lease for `scope`, whoever holds it.
    pub async fn release(&self, scope: &str) -> Result<()> {
        sqlx::query("DELETE FROM leases WHERE scope = ?")
            .bind(scope)
            .execute(&self.pool)
            .await?;
        tracing::trace!(scope, "lease released");
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
