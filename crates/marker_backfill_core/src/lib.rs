//! Resumable marker backfill primitives.
//!
//! This crate owns the checkpoint pager, the migration driver and the
//! invocation/result contracts. It intentionally excludes AWS SDK and Lambda
//! runtime concerns; storage is reached only through [`storage::MigrationTable`].

pub mod contract;
pub mod deadline;
pub mod driver;
pub mod pager;
pub mod storage;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
