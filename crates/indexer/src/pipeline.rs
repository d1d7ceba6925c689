//! Ingestion pipeline: token dedup and idempotent event writes.

use anyhow::Result;
use cohort_core::{Address, EventBatch, EventSelector, Token};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::storage::Storage;

/// Rows newly written by one or more ingestions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    /// Tokens stored for the first time.
    pub new_tokens: u64,

    /// Event rows stored for the first time, per selector.
    pub inserted: BTreeMap<EventSelector, u64>,
}

impl IngestSummary {
    /// Fold another summary into this one.
    pub fn merge(&mut self, other: IngestSummary) {
        self.new_tokens += other.new_tokens;
        for (selector, count) in other.inserted {
            *self.inserted.entry(selector).or_default() += count;
        }
    }

    /// Event rows inserted across all selectors.
    pub fn total_events(&self) -> u64 {
        self.inserted.values().sum()
    }
}

/// Every distinct token in `batch`, last occurrence winning.
pub fn collect_tokens(batch: &EventBatch) -> Vec<Token> {
    let mut tokens: HashMap<Address, Token> = HashMap::new();
    for token in batch.tokens() {
        tokens.insert(token.id, token.clone());
    }

    let mut tokens: Vec<_> = tokens.into_values().collect();
    tokens.sort_by_key(|token| token.id);
    tokens
}

/// Writes decoded batches to storage.
#[derive(Debug, Clone)]
pub struct IngestionPipeline {
    storage: Storage,
}

impl IngestionPipeline {
    /// Create a pipeline over `storage`.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Store one batch: tokens first, then each selector's rows.
    ///
    /// Existing rows are left untouched, so re-ingesting a batch is a no-op.
    pub async fn ingest(&self, batch: &EventBatch) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();
        if batch.is_empty() {
            return Ok(summary);
        }

        let tokens = collect_tokens(batch);
        summary.new_tokens = self.storage.insert_tokens_if_absent(&tokens).await?;

        for (selector, events) in batch.iter() {
            let inserted = self
                .storage
                .insert_events_if_absent(selector, events)
                .await?;
            debug!(%selector, received = events.len(), inserted, "Ingested events");
            summary.inserted.insert(selector, inserted);
        }

        Ok(summary)
    }
}
