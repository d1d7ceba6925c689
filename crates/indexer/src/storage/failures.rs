//! Failed range storage operations.

use super::{FailedRange, Storage};
use anyhow::{Context, Result};
use cohort_core::Protocol;
use sqlx::Row;

impl Storage {
    /// Record a failed sub-batch. Re-recording a range refreshes its error.
    pub async fn record_failure(
        &self,
        protocol: Protocol,
        from_block: u64,
        to_block: u64,
        error: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO sync_failures (protocol, from_block, to_block, error, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(protocol, from_block, to_block) DO UPDATE SET
                error = excluded.error,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(protocol.as_str())
        .bind(from_block as i64)
        .bind(to_block as i64)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to record sync failure")?;

        Ok(())
    }

    /// List failed ranges for a protocol, oldest block first.
    pub async fn list_failures(&self, protocol: Protocol) -> Result<Vec<FailedRange>> {
        let rows = sqlx::query(
            r#"
            SELECT protocol, from_block, to_block, error, recorded_at
            FROM sync_failures
            WHERE protocol = ?
            ORDER BY from_block ASC
            "#,
        )
        .bind(protocol.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list sync failures")?;

        rows.into_iter()
            .map(|row| -> Result<FailedRange> {
                let protocol: String = row.get("protocol");
                Ok(FailedRange {
                    protocol: protocol.parse()?,
                    from_block: row.get::<i64, _>("from_block") as u64,
                    to_block: row.get::<i64, _>("to_block") as u64,
                    error: row.get("error"),
                    recorded_at: row.get("recorded_at"),
                })
            })
            .collect()
    }

    /// Forget a failed range once it has been re-fetched.
    pub async fn delete_failure(
        &self,
        protocol: Protocol,
        from_block: u64,
        to_block: u64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM sync_failures WHERE protocol = ? AND from_block = ? AND to_block = ?",
        )
        .bind(protocol.as_str())
        .bind(from_block as i64)
        .bind(to_block as i64)
        .execute(&self.pool)
        .await
        .context("Failed to delete sync failure")?;

        Ok(result.rows_affected() == 1)
    }

    /// Count failed ranges for a protocol.
    pub async fn count_failures(&self, protocol: Protocol) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_failures WHERE protocol = ?")
            .bind(protocol.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }
}
