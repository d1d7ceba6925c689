//! Axum-based API server for Cohort.
//!
//! This crate provides:
//! - `POST /sync` - Register a protocol sync cursor
//! - `PATCH /sync/:protocol` - Repair a cursor (block number, syncing flag)
//! - `GET /sync/:protocol` - Read a cursor
//! - `GET /sync/:protocol/failures` - List failed ranges awaiting reconciliation
//! - `POST /event` - Address intersection across event kinds

#![warn(missing_docs)]

/// API server runtime and in-process app builder.
pub mod server;
