//! AWS-oriented adapters and handlers for the marker backfill.
//!
//! This crate owns runtime integration details (Lambda entry points, the
//! DynamoDB table adapter, self-continuation dispatch and environment
//! configuration). Pagination and marking live in `marker_backfill_core`.

pub mod adapters;
pub mod config;
pub mod handlers;
pub mod logging;
