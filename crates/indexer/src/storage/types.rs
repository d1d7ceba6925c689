//! Database types for the indexer storage layer.

use cohort_core::Protocol;
use serde::{Deserialize, Serialize};

/// Lease owner recorded when an operator sets `syncing = true` by hand.
///
/// Manual holds carry no expiry and are only released by another patch.
pub const MANUAL_LEASE_OWNER: &str = "manual";

/// Per-protocol sync checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    /// Protocol this cursor tracks.
    pub protocol: Protocol,

    /// Last fully processed block number.
    pub block_number: u64,

    /// Whether a sync pass currently holds the lease.
    pub syncing: bool,

    /// Owner token of the current lease.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,

    /// Unix timestamp after which the lease may be reclaimed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<i64>,

    /// Unix timestamp of last update.
    pub updated_at: i64,
}

impl SyncCursor {
    /// Whether a held lease has passed its expiry at `now`.
    pub fn lease_expired(&self, now: i64) -> bool {
        self.syncing && self.lease_expires_at.is_some_and(|expires| expires <= now)
    }

    /// Whether a new pass may start at `now`.
    pub fn is_available(&self, now: i64) -> bool {
        !self.syncing || self.lease_expired(now)
    }
}

/// Partial cursor update from the control surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPatch {
    /// New block number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,

    /// New syncing flag. `false` also drops any lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syncing: Option<bool>,
}

impl CursorPatch {
    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.block_number.is_none() && self.syncing.is_none()
    }
}

/// A sub-batch that failed during a pass that still advanced the cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRange {
    /// Protocol the range belongs to.
    pub protocol: Protocol,

    /// First block of the range.
    pub from_block: u64,

    /// Last block of the range (inclusive).
    pub to_block: u64,

    /// Last error observed for the range.
    pub error: String,

    /// Unix timestamp the failure was (last) recorded.
    pub recorded_at: i64,
}
