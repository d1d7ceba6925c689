//! Operator control surface.
//!
//! Cursor registration and repair plus intersection queries. Inputs arrive
//! as wire strings and are validated here before any storage access.

use cohort_core::{CoreError, EventSelector, Protocol, TimeWindow};
use serde::Deserialize;
use thiserror::Error;

use crate::intersection::{IntersectionEngine, IntersectionResult};
use crate::storage::{CursorPatch, FailedRange, Storage, SyncCursor};

/// Control surface errors.
#[derive(Error, Debug)]
pub enum ControlError {
    /// The protocol already has a cursor.
    #[error("Sync cursor already registered for {0}")]
    AlreadyRegistered(Protocol),

    /// No cursor exists for the protocol.
    #[error("No sync cursor registered for {0}")]
    NotFound(Protocol),

    /// Client input failed validation.
    #[error(transparent)]
    Invalid(#[from] CoreError),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Result type alias for control operations.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Cursor registration request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Protocol wire name.
    pub protocol: String,
    /// Initial cursor position.
    pub block_number: u64,
}

/// One `(protocol, event)` pair of an intersection query.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    /// Protocol wire name.
    pub protocol: String,
    /// Event kind wire name.
    pub event_name: String,
}

/// Intersection query: ordered filters over an epoch-millisecond window.
#[derive(Debug, Clone, Deserialize)]
pub struct IntersectionQuery {
    /// Filters applied in order.
    pub events: Vec<EventFilter>,
    /// Window start, epoch milliseconds.
    pub start: i64,
    /// Window end, epoch milliseconds.
    pub end: i64,
}

impl IntersectionQuery {
    /// Resolve every filter to a selector and build the window.
    ///
    /// The first unsupported pair fails the whole query.
    pub fn resolve(&self) -> Result<(Vec<EventSelector>, TimeWindow)> {
        let selectors = self
            .events
            .iter()
            .map(|filter| EventSelector::from_names(&filter.protocol, &filter.event_name))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let window = TimeWindow::from_millis(self.start, self.end)?;
        Ok((selectors, window))
    }
}

/// Register a cursor for a protocol that has none.
pub async fn register_cursor(storage: &Storage, request: &RegisterRequest) -> Result<SyncCursor> {
    let protocol: Protocol = request.protocol.parse()?;

    if !storage.insert_cursor(protocol, request.block_number).await? {
        return Err(ControlError::AlreadyRegistered(protocol));
    }

    storage
        .get_cursor(protocol)
        .await?
        .ok_or(ControlError::NotFound(protocol))
}

/// Apply an operator patch to an existing cursor.
pub async fn patch_cursor(
    storage: &Storage,
    protocol: &str,
    patch: &CursorPatch,
) -> Result<SyncCursor> {
    let protocol: Protocol = protocol.parse()?;

    storage
        .patch_cursor(protocol, patch)
        .await?
        .ok_or(ControlError::NotFound(protocol))
}

/// Current cursor of a protocol.
pub async fn get_cursor(storage: &Storage, protocol: &str) -> Result<SyncCursor> {
    let protocol: Protocol = protocol.parse()?;

    storage
        .get_cursor(protocol)
        .await?
        .ok_or(ControlError::NotFound(protocol))
}

/// Failed ranges awaiting reconciliation.
pub async fn list_failures(storage: &Storage, protocol: &str) -> Result<Vec<FailedRange>> {
    let protocol: Protocol = protocol.parse()?;
    Ok(storage.list_failures(protocol).await?)
}

/// Run an intersection query against stored events.
pub async fn intersect(storage: &Storage, query: &IntersectionQuery) -> Result<IntersectionResult> {
    let (selectors, window) = query.resolve()?;
    let engine = IntersectionEngine::new(storage.clone());
    Ok(engine.run(&selectors, window).await?)
}
