//! Subgraph event sync and address intersection for Cohort.
//!
//! This crate provides:
//! - Incremental, leased sync passes against protocol subgraphs
//! - Idempotent event and token ingestion into SQLite
//! - Failed-range bookkeeping and reconciliation
//! - Progressive address-set intersection across event kinds
//! - The operator control surface used by the API
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │  cohort-indexer (this)           │
//! │                                  │
//! │  ┌─────────────────┐             │
//! │  │  Sync Engine    │ ← Subgraph GraphQL
//! │  │ (one tokio task │   rate limited, retried
//! │  │  per protocol)  │             │
//! │  └────────┬────────┘             │
//! │           │                      │
//! │      ┌────▼──────────┐           │
//! │      │  Ingestion    │           │
//! │      │  Pipeline     │           │
//! │      └────┬──────────┘           │
//! │           │                      │
//! │      ┌────▼──────┐               │
//! │      │  Storage  │ ← SQLite      │
//! │      │ cursors,  │   insert-if-absent
//! │      │ events    │               │
//! │      └───────────┘               │
//! └──────────────────────────────────┘
//!          │
//!          │ Shared DB
//!          │
//! ┌────────▼──────────────────────┐
//! │   cohort-api (separate)       │
//! │                               │
//! │   ┌───────────────┐           │
//! │   │  API Server   │           │
//! │   │  (axum)       │           │
//! │   └───────┬───────┘           │
//! │           │                   │
//! │   ┌───────▼────────┐          │
//! │   │ Control +      │          │
//! │   │ Intersection   │          │
//! │   └────────────────┘          │
//! │                               │
//! │   Endpoints:                  │
//! │   • POST  /sync               │
//! │   • PATCH /sync/:protocol     │
//! │   • POST  /event              │
//! └───────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod control;
pub mod intersection;
pub mod listener;
pub mod pipeline;
pub mod storage;

// Re-export common types
pub use cohort_core::{types::*, *};
