//! # Cohort Core
//!
//! Domain types shared by the Cohort indexer and API.
//!
//! ## Features
//!
//! - **Protocols and selectors**: the closed set of `(protocol, event kind)`
//!   pairs Cohort can crawl and query, each mapped to one storage table
//! - **Normalized events**: [`EventRecord`], [`Token`] and [`EventBatch`]
//! - **Batch planning**: catch-up sizing for sync passes
//! - **Ethereum types**: Alloy primitives for addresses and hashes

#![warn(missing_docs)]

pub mod batch;
pub mod constants;
pub mod error;
pub mod types;

pub use batch::BatchPlan;
pub use constants::*;
pub use error::{CoreError, Result};
pub use types::*;

// Re-export Alloy primitives for convenience
pub use alloy_primitives::{Address, B256};
