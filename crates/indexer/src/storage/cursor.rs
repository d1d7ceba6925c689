//! Sync cursor storage operations.
//!
//! A cursor doubles as the per-protocol sync lease. Acquiring, extending and
//! releasing the lease are single conditional `UPDATE`s, so two passes can
//! never both observe the cursor as free.

use super::{CursorPatch, Storage, SyncCursor, MANUAL_LEASE_OWNER};
use anyhow::{Context, Result};
use cohort_core::Protocol;
use sqlx::Row;

const CURSOR_COLUMNS: &str =
    "protocol, block_number, syncing, lease_owner, lease_expires_at, updated_at";

impl Storage {
    /// Get the cursor for a protocol.
    pub async fn get_cursor(&self, protocol: Protocol) -> Result<Option<SyncCursor>> {
        let row = sqlx::query(&format!(
            "SELECT {CURSOR_COLUMNS} FROM sync_cursors WHERE protocol = ?"
        ))
        .bind(protocol.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch sync cursor")?;

        row.map(Self::row_to_cursor).transpose()
    }

    /// List every registered cursor, ordered by protocol name.
    pub async fn list_cursors(&self) -> Result<Vec<SyncCursor>> {
        let rows = sqlx::query(&format!(
            "SELECT {CURSOR_COLUMNS} FROM sync_cursors ORDER BY protocol"
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list sync cursors")?;

        rows.into_iter().map(Self::row_to_cursor).collect()
    }

    /// Register a cursor.
    ///
    /// Returns `false` if the protocol already has one; the existing row is
    /// left untouched.
    pub async fn insert_cursor(&self, protocol: Protocol, block_number: u64) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO sync_cursors (protocol, block_number, syncing, updated_at)
            VALUES (?, ?, 0, ?)
            ON CONFLICT(protocol) DO NOTHING
            "#,
        )
        .bind(protocol.as_str())
        .bind(block_number as i64)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to insert sync cursor")?;

        Ok(result.rows_affected() == 1)
    }

    /// Apply an operator patch.
    ///
    /// `syncing = true` takes a manual hold with no expiry; `syncing = false`
    /// drops whatever lease is held. Returns `None` if the protocol has no
    /// cursor.
    pub async fn patch_cursor(
        &self,
        protocol: Protocol,
        patch: &CursorPatch,
    ) -> Result<Option<SyncCursor>> {
        let now = chrono::Utc::now().timestamp();

        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_cursors
            SET block_number = COALESCE(?2, block_number),
                syncing = COALESCE(?3, syncing),
                lease_owner = CASE
                    WHEN ?3 IS NULL THEN lease_owner
                    WHEN ?3 = 1 THEN ?4
                    ELSE NULL
                END,
                lease_expires_at = CASE WHEN ?3 IS NULL THEN lease_expires_at ELSE NULL END,
                updated_at = ?5
            WHERE protocol = ?1
            RETURNING {CURSOR_COLUMNS}
            "#
        ))
        .bind(protocol.as_str())
        .bind(patch.block_number.map(|n| n as i64))
        .bind(patch.syncing)
        .bind(MANUAL_LEASE_OWNER)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to patch sync cursor")?;

        row.map(Self::row_to_cursor).transpose()
    }

    /// Take the sync lease if it is free or expired at `now`.
    ///
    /// Returns the cursor as of acquisition, or `None` if another owner holds
    /// a live lease or the protocol is not registered.
    pub async fn try_acquire_lease(
        &self,
        protocol: Protocol,
        owner: &str,
        now: i64,
        ttl_secs: u64,
    ) -> Result<Option<SyncCursor>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_cursors
            SET syncing = 1,
                lease_owner = ?2,
                lease_expires_at = ?3,
                updated_at = ?4
            WHERE protocol = ?1
              AND (syncing = 0 OR (lease_expires_at IS NOT NULL AND lease_expires_at <= ?4))
            RETURNING {CURSOR_COLUMNS}
            "#
        ))
        .bind(protocol.as_str())
        .bind(owner)
        .bind(now.saturating_add(ttl_secs as i64))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to acquire sync lease")?;

        row.map(Self::row_to_cursor).transpose()
    }

    /// Push the lease expiry forward. Returns `false` if `owner` lost the lease.
    pub async fn extend_lease(
        &self,
        protocol: Protocol,
        owner: &str,
        now: i64,
        ttl_secs: u64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_cursors
            SET lease_expires_at = ?, updated_at = ?
            WHERE protocol = ? AND syncing = 1 AND lease_owner = ?
            "#,
        )
        .bind(now.saturating_add(ttl_secs as i64))
        .bind(now)
        .bind(protocol.as_str())
        .bind(owner)
        .execute(&self.pool)
        .await
        .context("Failed to extend sync lease")?;

        Ok(result.rows_affected() == 1)
    }

    /// Release the lease and advance the cursor to `block_number`.
    ///
    /// The cursor never moves backwards. Returns `false` (and writes nothing)
    /// if `owner` no longer holds the lease.
    pub async fn release_lease(
        &self,
        protocol: Protocol,
        owner: &str,
        block_number: u64,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE sync_cursors
            SET block_number = MAX(block_number, ?),
                syncing = 0,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = ?
            WHERE protocol = ? AND syncing = 1 AND lease_owner = ?
            "#,
        )
        .bind(block_number as i64)
        .bind(now)
        .bind(protocol.as_str())
        .bind(owner)
        .execute(&self.pool)
        .await
        .context("Failed to release sync lease")?;

        Ok(result.rows_affected() == 1)
    }

    fn row_to_cursor(row: sqlx::sqlite::SqliteRow) -> Result<SyncCursor> {
        let protocol: String = row.get("protocol");

        Ok(SyncCursor {
            protocol: protocol.parse()?,
            block_number: row.get::<i64, _>("block_number") as u64,
            syncing: row.get("syncing"),
            lease_owner: row.get("lease_owner"),
            lease_expires_at: row.get("lease_expires_at"),
            updated_at: row.get("updated_at"),
        })
    }
}
