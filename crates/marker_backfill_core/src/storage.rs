use std::collections::BTreeMap;
use std::num::NonZeroU32;

use serde_json::Value;
use thiserror::Error;

use crate::contract::{ContinuationToken, MigrationMarker};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("scan failed: {0}")]
    Scan(String),
    #[error("batch write failed: {0}")]
    Write(String),
    #[error("invalid continuation token: {0}")]
    Token(String),
}

/// A record the driver can stamp with the migration marker.
pub trait MigrationRecord {
    fn set_marker(&mut self, marker: &MigrationMarker);
}

/// Attribute map used by the in-memory table and by tooling that handles
/// plain JSON items.
pub type JsonRecord = BTreeMap<String, Value>;

impl MigrationRecord for JsonRecord {
    fn set_marker(&mut self, marker: &MigrationMarker) {
        self.insert(
            marker.attribute.clone(),
            Value::String(marker.value.clone()),
        );
    }
}

/// One filtered scan call: "marker attribute is absent", starting after
/// `start_token`.
#[derive(Debug, Clone, Copy)]
pub struct ScanRequest<'a> {
    pub marker_attribute: &'a str,
    pub start_token: Option<&'a ContinuationToken>,
    pub page_size: Option<NonZeroU32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<R> {
    pub records: Vec<R>,
    pub next_token: Option<ContinuationToken>,
}

impl<R> Page<R> {
    pub fn is_terminal(&self) -> bool {
        self.next_token.is_none()
    }
}

/// Storage capability consumed by the pager and driver. Both calls are
/// blocking round trips; neither retries on its own account.
pub trait MigrationTable {
    type Record: MigrationRecord;

    fn scan_unmigrated(&self, request: ScanRequest<'_>) -> Result<Page<Self::Record>, StorageError>;

    /// Best-effort batched upsert of whole records. Not atomic across records.
    fn put_batch(&self, records: Vec<Self::Record>) -> Result<(), StorageError>;
}
