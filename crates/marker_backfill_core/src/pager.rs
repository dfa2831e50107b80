use std::num::NonZeroU32;

use crate::contract::{ContinuationToken, StopReason};
use crate::storage::{MigrationTable, Page, ScanRequest, StorageError};

/// Walks the "not yet migrated" scan one page at a time.
///
/// The pager is read-only: it never writes to the table and never retries a
/// failed scan. It stops handing out pages once the source is exhausted or
/// `batch_limit` pages have been fetched (0 means unlimited).
pub struct CheckpointPager<'a, T: MigrationTable> {
    table: &'a T,
    marker_attribute: &'a str,
    page_size: Option<NonZeroU32>,
    batch_limit: usize,
    cursor: Option<ContinuationToken>,
    pages_fetched: usize,
    exhausted: bool,
}

impl<'a, T: MigrationTable> CheckpointPager<'a, T> {
    pub fn new(
        table: &'a T,
        marker_attribute: &'a str,
        start_token: Option<ContinuationToken>,
    ) -> Self {
        Self {
            table,
            marker_attribute,
            page_size: None,
            batch_limit: 0,
            cursor: start_token,
            pages_fetched: 0,
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: Option<NonZeroU32>) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit;
        self
    }

    /// Single filtered scan starting after `token`. Does not move the cursor.
    pub fn fetch_page(
        &self,
        token: Option<&ContinuationToken>,
    ) -> Result<Page<T::Record>, StorageError> {
        self.table.scan_unmigrated(ScanRequest {
            marker_attribute: self.marker_attribute,
            start_token: token,
            page_size: self.page_size,
        })
    }

    /// Fetches the page at the cursor and advances past it. Returns `Ok(None)`
    /// once [`CheckpointPager::stop_reason`] reports a stop.
    pub fn next_page(&mut self) -> Result<Option<Page<T::Record>>, StorageError> {
        if self.stop_reason().is_some() {
            return Ok(None);
        }

        let page = self.fetch_page(self.cursor.as_ref())?;
        self.pages_fetched += 1;
        self.cursor = page.next_token.clone();
        self.exhausted = page.is_terminal();
        Ok(Some(page))
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        if self.exhausted {
            Some(StopReason::Exhausted)
        } else if self.batch_limit > 0 && self.pages_fetched >= self.batch_limit {
            Some(StopReason::BatchLimit)
        } else {
            None
        }
    }

    pub fn cursor(&self) -> Option<&ContinuationToken> {
        self.cursor.as_ref()
    }

    pub fn into_cursor(self) -> Option<ContinuationToken> {
        self.cursor
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::InMemoryTable;

    const MARKER: &str = "pre_existing_processed";

    #[test]
    fn walks_pages_in_key_order_until_exhausted() {
        let table = InMemoryTable::with_unmarked_records(5).with_page_size(2);
        let mut pager = CheckpointPager::new(&table, MARKER, None);

        let mut sizes = Vec::new();
        while let Some(page) = pager.next_page().expect("scan should succeed") {
            sizes.push(page.records.len());
        }

        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(pager.pages_fetched(), 3);
        assert_eq!(pager.stop_reason(), Some(StopReason::Exhausted));
        assert!(pager.cursor().is_none());
        assert!(table.marked_keys().is_empty(), "pager must not write");
    }

    #[test]
    fn stops_at_batch_limit_with_cursor_after_last_page() {
        let table = InMemoryTable::with_unmarked_records(10).with_page_size(3);
        let mut pager = CheckpointPager::new(&table, MARKER, None).with_batch_limit(2);

        assert!(pager.next_page().expect("first page").is_some());
        assert!(pager.next_page().expect("second page").is_some());
        assert!(pager.next_page().expect("limit reached").is_none());

        assert_eq!(pager.stop_reason(), Some(StopReason::BatchLimit));
        assert_eq!(pager.cursor(), Some(&InMemoryTable::token_for(5)));
        assert_eq!(table.scan_calls(), 2);
    }

    #[test]
    fn fetch_page_is_repeatable_for_the_same_token() {
        let table = InMemoryTable::with_unmarked_records(4).with_page_size(2);
        let pager = CheckpointPager::new(&table, MARKER, None);
        let token = InMemoryTable::token_for(1);

        let first = pager.fetch_page(Some(&token)).expect("scan should succeed");
        let second = pager.fetch_page(Some(&token)).expect("scan should succeed");

        assert_eq!(first, second);
        assert_eq!(pager.pages_fetched(), 0);
    }

    #[test]
    fn scan_failure_surfaces_without_retry() {
        let table = InMemoryTable::with_unmarked_records(4)
            .with_page_size(2)
            .fail_scan_on_call(1, "AccessDeniedException: not authorized");
        let mut pager = CheckpointPager::new(&table, MARKER, None);

        let error = pager.next_page().expect_err("scan should fail");
        assert!(error.to_string().contains("AccessDeniedException"));
        assert_eq!(table.scan_calls(), 1);
        assert_eq!(pager.pages_fetched(), 0);
    }
}
