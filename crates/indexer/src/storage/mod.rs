//! Storage layer for the Cohort indexer.
//!
//! This module provides database operations for:
//! - Sync cursors (per-protocol progress and the sync lease)
//! - Failed ranges (sub-batches awaiting reconciliation)
//! - Tokens and event rows (insert-if-absent)
//! - Participant lookups for the intersection engine

use anyhow::{Context, Result};
use cohort_core::EventSelector;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub mod cursor;
pub mod events;
pub mod failures;
pub mod types;

pub use types::*;

/// Database storage for the indexer.
///
/// Provides async access to SQLite database with connection pooling.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance with the given database URL.
    ///
    /// This will create the database file if it doesn't exist. Call
    /// [`Storage::run_migrations`] before first use.
    ///
    /// # Arguments
    /// * `database_url` - SQLite database URL (e.g., "sqlite://cohort.db")
    /// * `max_connections` - Pool ceiling (default 5)
    /// * `min_connections` - Connections kept warm (default 1)
    ///
    /// # Example
    /// ```no_run
    /// # use cohort_indexer::storage::Storage;
    /// # async fn example() -> anyhow::Result<()> {
    /// let storage = Storage::new("sqlite://cohort.db", None, None).await?;
    /// storage.run_migrations().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(
        database_url: &str,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self> {
        info!("Connecting to database: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.unwrap_or(5))
            .min_connections(min_connections.unwrap_or(1))
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        info!("Database connection established");

        Ok(Self { pool })
    }

    /// Create a new storage instance with a specific file path.
    pub async fn new_with_path<P: AsRef<Path>>(
        path: P,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self> {
        let database_url = format!("sqlite://{}", path.as_ref().display());
        Self::new(&database_url, max_connections, min_connections).await
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Migrations completed successfully");

        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        info!("Closing database connection");
        self.pool.close().await;
    }

    /// Get database statistics.
    pub async fn stats(&self) -> Result<DatabaseStats> {
        let cursor_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_cursors")
            .fetch_one(&self.pool)
            .await?;

        let token_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tokens")
            .fetch_one(&self.pool)
            .await?;

        let failure_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_failures")
            .fetch_one(&self.pool)
            .await?;

        let mut event_counts = Vec::with_capacity(EventSelector::ALL.len());
        for selector in EventSelector::ALL {
            event_counts.push((selector, self.count_events(selector).await?));
        }

        Ok(DatabaseStats {
            cursor_count: cursor_count as u64,
            token_count: token_count as u64,
            failure_count: failure_count as u64,
            event_counts,
        })
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;

        Ok(())
    }
}

/// Database statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Registered protocol cursors
    pub cursor_count: u64,

    /// Distinct tokens
    pub token_count: u64,

    /// Failed ranges awaiting reconciliation
    pub failure_count: u64,

    /// Stored rows per event table
    pub event_counts: Vec<(EventSelector, u64)>,
}
