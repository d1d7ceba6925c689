//! Sync orchestrator: one incremental crawler per protocol.
//!
//! A tick reads the cursor, asks the subgraph for its head, and when behind
//! takes the cursor lease, walks the planned sub-batches in block order,
//! ingests each one, and finally advances the cursor and drops the lease.
//! Failed sub-batches are reported and persisted for [`SyncEngine::reconcile`]
//! but never hold the cursor back.

use anyhow::Result;
use cohort_core::{BatchPlan, Protocol};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{EventSource, FetchSession, RateLimitedFetcher};
use crate::config::SyncConfig;
use crate::pipeline::{IngestSummary, IngestionPipeline};
use crate::storage::{FailedRange, Storage, SyncCursor};

static PASS_SEQ: AtomicU64 = AtomicU64::new(0);

/// Lease owner token, unique per pass.
fn lease_owner(protocol: Protocol) -> String {
    format!(
        "{}:{}:{}:{}",
        protocol,
        std::process::id(),
        chrono::Utc::now().timestamp_millis(),
        PASS_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    /// Protocol synced.
    pub protocol: Protocol,

    /// First block covered.
    pub from_block: u64,

    /// Last block covered; the cursor target.
    pub to_block: u64,

    /// Upstream calls made (one per sub-batch).
    pub sub_batches: usize,

    /// Rows newly stored.
    pub ingested: IngestSummary,

    /// Sub-batches whose fetch or ingestion failed.
    pub failed: Vec<FailedRange>,

    /// Whether the cursor was advanced to `to_block`.
    pub advanced: bool,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Ranges re-ingested and cleared.
    pub recovered: Vec<(u64, u64)>,

    /// Ranges that failed again and stay recorded.
    pub still_failing: Vec<FailedRange>,

    /// Rows newly stored.
    pub ingested: IngestSummary,
}

/// Drives sync passes for a single protocol.
pub struct SyncEngine<S> {
    fetcher: RateLimitedFetcher<S>,
    storage: Storage,
    pipeline: IngestionPipeline,
    lease_ttl_secs: u64,
}

impl<S: EventSource> SyncEngine<S> {
    /// Create a sync engine for the protocol served by `source`.
    pub fn new(source: S, storage: Storage, config: &SyncConfig) -> Self {
        Self {
            fetcher: RateLimitedFetcher::new(source, config),
            pipeline: IngestionPipeline::new(storage.clone()),
            storage,
            lease_ttl_secs: config.lease_ttl_secs,
        }
    }

    /// Protocol this engine syncs.
    pub fn protocol(&self) -> Protocol {
        self.fetcher.protocol()
    }

    /// Run ticks every `poll_interval` until the task is dropped.
    ///
    /// Each tick completes before the next one starts. Tick errors are
    /// logged and the loop keeps going.
    pub async fn run(&self, poll_interval: Duration) {
        info!(protocol = %self.protocol(), "Sync engine starting with interval: {:?}", poll_interval);

        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if let Err(e) = self.tick().await {
                error!(protocol = %self.protocol(), "Sync tick failed: {:#}", e);
            }
        }
    }

    /// Run at most one pass.
    ///
    /// Returns `None` when the tick was a no-op: no cursor, a live lease held
    /// elsewhere, or nothing to catch up.
    pub async fn tick(&self) -> Result<Option<PassReport>> {
        let protocol = self.protocol();

        let Some(cursor) = self.storage.get_cursor(protocol).await? else {
            debug!(%protocol, "No cursor registered, skipping tick");
            return Ok(None);
        };

        let started = now();
        if !cursor.is_available(started) {
            debug!(%protocol, owner = ?cursor.lease_owner, "Sync already in progress, skipping tick");
            return Ok(None);
        }

        let head = self.fetcher.current_head().await?;
        if BatchPlan::for_diff(head.saturating_sub(cursor.block_number)).is_none() {
            debug!(%protocol, cursor = cursor.block_number, head, "Caught up");
            return Ok(None);
        }

        if cursor.lease_expired(started) {
            warn!(
                %protocol,
                owner = ?cursor.lease_owner,
                expired_at = ?cursor.lease_expires_at,
                "Reclaiming expired sync lease"
            );
        }

        let owner = lease_owner(protocol);
        let Some(cursor) = self
            .storage
            .try_acquire_lease(protocol, &owner, started, self.lease_ttl_secs)
            .await?
        else {
            debug!(%protocol, "Lost the race for the sync lease");
            return Ok(None);
        };

        match self.pass(&owner, &cursor, head).await {
            Ok(report) => Ok(report),
            Err(e) => {
                // Drop the lease without moving the cursor. The pass error
                // is the one returned; a failed release is only logged.
                if let Err(release_err) = self
                    .storage
                    .release_lease(protocol, &owner, cursor.block_number)
                    .await
                {
                    error!(%protocol, %owner, "Failed to release sync lease after pass error: {:#}", release_err);
                }
                Err(e)
            }
        }
    }

    async fn pass(&self, owner: &str, cursor: &SyncCursor, head: u64) -> Result<Option<PassReport>> {
        let protocol = self.protocol();

        // The cursor may have been patched between the first read and the
        // acquisition, so plan from the leased copy.
        let Some(plan) = BatchPlan::for_diff(head.saturating_sub(cursor.block_number)) else {
            self.storage
                .release_lease(protocol, owner, cursor.block_number)
                .await?;
            return Ok(None);
        };

        let target = plan.target(cursor.block_number);
        info!(
            %protocol,
            from = cursor.block_number + 1,
            to = target,
            head,
            query_length = plan.query_length,
            per_query = plan.per_query,
            "Starting sync pass"
        );

        let session = self.fetcher.session();
        let mut report = PassReport {
            protocol,
            from_block: cursor.block_number + 1,
            to_block: target,
            sub_batches: 0,
            ingested: IngestSummary::default(),
            failed: Vec::new(),
            advanced: false,
        };

        let mut lease_held = true;
        for range in plan.sub_batches(cursor.block_number) {
            let (from, to) = (*range.start(), *range.end());
            let blocks: Vec<u64> = range.collect();
            report.sub_batches += 1;

            match self.fetch_and_ingest(&session, &blocks).await {
                Ok(summary) => {
                    debug!(%protocol, from, to, events = summary.total_events(), "Sub-batch ingested");
                    report.ingested.merge(summary);
                }
                Err(e) => {
                    let error = format!("{e:#}");
                    warn!(%protocol, from, to, "Sub-batch failed: {}", error);

                    self.storage
                        .record_failure(protocol, from, to, &error)
                        .await?;
                    report.failed.push(FailedRange {
                        protocol,
                        from_block: from,
                        to_block: to,
                        error,
                        recorded_at: now(),
                    });
                }
            }

            if !self
                .storage
                .extend_lease(protocol, owner, now(), self.lease_ttl_secs)
                .await?
            {
                lease_held = false;
                break;
            }
        }

        report.advanced = lease_held
            && self
                .storage
                .release_lease(protocol, owner, target)
                .await?;

        if report.advanced {
            info!(
                %protocol,
                cursor = target,
                events = report.ingested.total_events(),
                new_tokens = report.ingested.new_tokens,
                failed = report.failed.len(),
                "Sync pass complete"
            );
        } else {
            warn!(%protocol, "Sync lease was taken over mid-pass; cursor not advanced");
        }

        Ok(Some(report))
    }

    async fn fetch_and_ingest(
        &self,
        session: &FetchSession<'_, S>,
        blocks: &[u64],
    ) -> Result<IngestSummary> {
        let batch = session.events_for_blocks(blocks).await?;
        self.pipeline.ingest(&batch).await
    }

    /// Re-fetch every recorded failed range.
    ///
    /// Ranges that now succeed are cleared; the rest keep their record with
    /// a refreshed error. The cursor is never moved. Returns `None` if a
    /// live lease is held elsewhere.
    pub async fn reconcile(&self) -> Result<Option<ReconcileReport>> {
        let protocol = self.protocol();
        let mut report = ReconcileReport::default();

        let failures = self.storage.list_failures(protocol).await?;
        if failures.is_empty() {
            return Ok(Some(report));
        }

        let owner = lease_owner(protocol);
        let Some(cursor) = self
            .storage
            .try_acquire_lease(protocol, &owner, now(), self.lease_ttl_secs)
            .await?
        else {
            return Ok(None);
        };

        info!(%protocol, ranges = failures.len(), "Reconciling failed ranges");

        let result = self.reconcile_ranges(&owner, failures, &mut report).await;
        self.storage
            .release_lease(protocol, &owner, cursor.block_number)
            .await?;
        result?;

        info!(
            %protocol,
            recovered = report.recovered.len(),
            still_failing = report.still_failing.len(),
            "Reconciliation complete"
        );

        Ok(Some(report))
    }

    async fn reconcile_ranges(
        &self,
        owner: &str,
        failures: Vec<FailedRange>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let protocol = self.protocol();
        let session = self.fetcher.session();

        for failure in failures {
            let blocks: Vec<u64> = (failure.from_block..=failure.to_block).collect();

            match self.fetch_and_ingest(&session, &blocks).await {
                Ok(summary) => {
                    self.storage
                        .delete_failure(protocol, failure.from_block, failure.to_block)
                        .await?;
                    report.ingested.merge(summary);
                    report.recovered.push((failure.from_block, failure.to_block));
                }
                Err(e) => {
                    let error = format!("{e:#}");
                    warn!(
                        %protocol,
                        from = failure.from_block,
                        to = failure.to_block,
                        "Range still failing: {}",
                        error
                    );
                    self.storage
                        .record_failure(protocol, failure.from_block, failure.to_block, &error)
                        .await?;
                    report.still_failing.push(FailedRange {
                        error,
                        recorded_at: now(),
                        ..failure
                    });
                }
            }

            if !self
                .storage
                .extend_lease(protocol, owner, now(), self.lease_ttl_secs)
                .await?
            {
                warn!(%protocol, "Sync lease was taken over during reconciliation");
                break;
            }
        }

        Ok(())
    }
}
