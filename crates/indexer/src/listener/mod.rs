//! Subgraph listener for protocol event history.
//!
//! This module provides:
//! - GraphQL query building and row decoding per protocol
//! - HTTP subgraph provider behind the [`EventSource`] seam
//! - Retry and rate limiting around any source
//! - Sync engine driving incremental, leased catch-up passes

pub mod events;
pub mod fetcher;
pub mod provider;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use fetcher::{FetchSession, RateLimitedFetcher};
pub use provider::{EventSource, SubgraphProvider};
pub use sync::{PassReport, ReconcileReport, SyncEngine};
