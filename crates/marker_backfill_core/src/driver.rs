use std::num::NonZeroU32;

use crate::contract::{ContinuationToken, MigrationMarker, RunResult, RunSummary, StopReason};
use crate::deadline::{Clock, Deadline};
use crate::pager::CheckpointPager;
use crate::storage::{MigrationRecord, MigrationTable, StorageError};

/// Progress notification emitted after each page's write completes.
#[derive(Debug, Clone, Copy)]
pub struct PageReport<'a> {
    pub page_number: usize,
    pub records_written: usize,
    pub next_token: Option<&'a ContinuationToken>,
}

/// Marks and rewrites every unmigrated record reachable from a start token,
/// one page at a time, until the source is exhausted, the batch limit is hit
/// or the deadline passes.
pub struct MigrationDriver<'a, T: MigrationTable, C: Clock> {
    table: &'a T,
    marker: &'a MigrationMarker,
    clock: &'a C,
    page_size: Option<NonZeroU32>,
}

impl<'a, T: MigrationTable, C: Clock> MigrationDriver<'a, T, C> {
    pub fn new(table: &'a T, marker: &'a MigrationMarker, clock: &'a C) -> Self {
        Self {
            table,
            marker,
            clock,
            page_size: None,
        }
    }

    pub fn with_page_size(mut self, page_size: Option<NonZeroU32>) -> Self {
        self.page_size = page_size;
        self
    }

    /// `batch_limit` of 0 means unlimited. The first page is always fetched;
    /// `deadline` is consulted only before each following page.
    pub fn run(
        &self,
        start_token: Option<ContinuationToken>,
        batch_limit: usize,
        deadline: Deadline,
    ) -> RunResult {
        self.run_with_progress(start_token, batch_limit, deadline, &mut |_| {})
    }

    pub fn run_with_progress(
        &self,
        start_token: Option<ContinuationToken>,
        batch_limit: usize,
        deadline: Deadline,
        on_page: &mut dyn FnMut(PageReport<'_>),
    ) -> RunResult {
        match self.migrate(start_token, batch_limit, deadline, on_page) {
            Ok(summary) => RunResult::Success(summary),
            Err(error) => RunResult::error(error.to_string()),
        }
    }

    fn migrate(
        &self,
        start_token: Option<ContinuationToken>,
        batch_limit: usize,
        deadline: Deadline,
        on_page: &mut dyn FnMut(PageReport<'_>),
    ) -> Result<RunSummary, StorageError> {
        let mut pager = CheckpointPager::new(self.table, &self.marker.attribute, start_token)
            .with_page_size(self.page_size)
            .with_batch_limit(batch_limit);
        let mut records_migrated = 0usize;

        let stop_reason = loop {
            let Some(page) = pager.next_page()? else {
                break pager.stop_reason().unwrap_or(StopReason::Exhausted);
            };

            let records_written = self.write_page(page.records)?;
            records_migrated += records_written;
            on_page(PageReport {
                page_number: pager.pages_fetched(),
                records_written,
                next_token: pager.cursor(),
            });

            if let Some(reason) = pager.stop_reason() {
                break reason;
            }
            if deadline.has_passed(self.clock.now()) {
                break StopReason::Deadline;
            }
        };

        let batches_processed = pager.pages_fetched();
        Ok(RunSummary {
            next_token: pager.into_cursor(),
            batches_processed,
            records_migrated,
            stop_reason,
        })
    }

    fn write_page(&self, mut records: Vec<T::Record>) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }

        for record in &mut records {
            record.set_marker(self.marker);
        }
        let count = records.len();
        self.table.put_batch(records)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::deadline::SystemClock;
    use crate::test_helpers::{InMemoryTable, ManualClock};

    #[test]
    fn five_records_in_pages_of_two_take_three_writes() {
        let table = InMemoryTable::with_unmarked_records(5).with_page_size(2);
        let marker = MigrationMarker::default();

        let result = MigrationDriver::new(&table, &marker, &SystemClock).run(
            None,
            0,
            Deadline::Unbounded,
        );

        let summary = result.into_result().expect("run should succeed");
        assert_eq!(summary.next_token, None);
        assert_eq!(summary.batches_processed, 3);
        assert_eq!(summary.records_migrated, 5);
        assert_eq!(summary.stop_reason, StopReason::Exhausted);
        assert_eq!(table.written_batch_sizes(), vec![2, 2, 1]);
        assert!(table.unmarked_keys().is_empty());
    }

    #[test]
    fn empty_page_skips_the_write_call() {
        let table = InMemoryTable::new();
        let marker = MigrationMarker::default();

        let summary = MigrationDriver::new(&table, &marker, &SystemClock)
            .run(None, 0, Deadline::Unbounded)
            .into_result()
            .expect("run should succeed");

        assert_eq!(summary.batches_processed, 1);
        assert_eq!(summary.records_migrated, 0);
        assert_eq!(table.write_calls(), 0);
    }

    #[test]
    fn passed_deadline_still_processes_the_first_page() {
        let clock = ManualClock::new();
        let table = InMemoryTable::with_unmarked_records(6).with_page_size(2);
        let marker = MigrationMarker::default();
        let deadline = Deadline::At(clock.now());

        let summary = MigrationDriver::new(&table, &marker, &clock)
            .run(None, 0, deadline)
            .into_result()
            .expect("run should succeed");

        assert_eq!(summary.batches_processed, 1);
        assert_eq!(summary.stop_reason, StopReason::Deadline);
        assert_eq!(summary.next_token, Some(InMemoryTable::token_for(1)));
    }

    #[test]
    fn deadline_is_checked_only_between_pages() {
        let clock = Arc::new(ManualClock::new());
        let deadline = Deadline::At(clock.now() + Duration::from_millis(150));
        // Each write takes 100ms: the check after page 1 passes, the one after
        // page 2 does not, and page 2's write runs past the deadline.
        let table = InMemoryTable::with_unmarked_records(8)
            .with_page_size(2)
            .with_write_latency(Arc::clone(&clock), Duration::from_millis(100));
        let marker = MigrationMarker::default();

        let summary = MigrationDriver::new(&table, &marker, &*clock)
            .run(None, 0, deadline)
            .into_result()
            .expect("run should succeed");

        assert_eq!(summary.batches_processed, 2);
        assert_eq!(summary.stop_reason, StopReason::Deadline);
        assert_eq!(table.marked_keys().len(), 4);
        assert_eq!(table.scan_calls(), 2);
    }

    #[test]
    fn custom_marker_attribute_is_used_for_filter_and_stamp() {
        let table = InMemoryTable::with_unmarked_records(3);
        let marker = MigrationMarker::new("backfilled_v2", "1");

        let summary = MigrationDriver::new(&table, &marker, &SystemClock)
            .run(None, 0, Deadline::Unbounded)
            .into_result()
            .expect("run should succeed");

        assert_eq!(summary.records_migrated, 3);
        assert_eq!(table.marked_keys_with("backfilled_v2").len(), 3);
        assert!(table.marked_keys().is_empty());
        assert!(table
            .records()
            .iter()
            .all(|record| record["backfilled_v2"] == serde_json::json!("1")));
    }

    #[test]
    fn scan_page_size_overrides_table_default() {
        let table = InMemoryTable::with_unmarked_records(6).with_page_size(4);
        let marker = MigrationMarker::default();

        MigrationDriver::new(&table, &marker, &SystemClock)
            .with_page_size(NonZeroU32::new(3))
            .run(None, 0, Deadline::Unbounded)
            .into_result()
            .expect("run should succeed");

        assert_eq!(table.written_batch_sizes(), vec![3, 3]);
    }

    #[test]
    fn progress_reports_follow_scan_order() {
        let table = InMemoryTable::with_unmarked_records(5).with_page_size(2);
        let marker = MigrationMarker::default();
        let mut reports = Vec::new();

        MigrationDriver::new(&table, &marker, &SystemClock).run_with_progress(
            None,
            0,
            Deadline::Unbounded,
            &mut |report| {
                reports.push((
                    report.page_number,
                    report.records_written,
                    report.next_token.cloned(),
                ))
            },
        );

        assert_eq!(
            reports,
            vec![
                (1, 2, Some(InMemoryTable::token_for(1))),
                (2, 2, Some(InMemoryTable::token_for(3))),
                (3, 1, None),
            ]
        );
    }

    #[test]
    fn malformed_start_token_is_reported_as_error() {
        let table = InMemoryTable::with_unmarked_records(2);
        let marker = MigrationMarker::default();
        let token = ContinuationToken::from_map(serde_json::Map::from_iter([(
            "sk".to_string(),
            serde_json::json!(7),
        )]))
        .expect("non-empty key");

        let result = MigrationDriver::new(&table, &marker, &SystemClock).run(
            Some(token),
            0,
            Deadline::Unbounded,
        );

        let message = result.into_result().expect_err("run should fail");
        assert!(message.starts_with("invalid continuation token"));
        assert_eq!(table.write_calls(), 0);
    }
}
