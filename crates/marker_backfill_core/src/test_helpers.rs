//! In-memory fakes for the storage capability and the clock.
//!
//! `InMemoryTable` mimics a key-ordered table scan: each call evaluates up to
//! `page_size` records after the exclusive start key, returns the ones lacking
//! the marker attribute, and hands back the last evaluated key while records
//! remain beyond it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::contract::ContinuationToken;
use crate::deadline::Clock;
use crate::storage::{JsonRecord, MigrationTable, Page, ScanRequest, StorageError};

pub const KEY_ATTRIBUTE: &str = "pk";

#[derive(Debug)]
struct Injection {
    call: usize,
    message: String,
}

#[derive(Debug, Default)]
struct TableState {
    records: BTreeMap<String, JsonRecord>,
    scan_calls: usize,
    write_calls: usize,
    written_batch_sizes: Vec<usize>,
    scanned_tokens: Vec<Option<ContinuationToken>>,
}

pub struct InMemoryTable {
    state: Mutex<TableState>,
    page_size: Option<usize>,
    scan_failure: Option<Injection>,
    write_failure: Option<Injection>,
    write_latency: Option<(Arc<ManualClock>, Duration)>,
}

impl InMemoryTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            page_size: None,
            scan_failure: None,
            write_failure: None,
            write_latency: None,
        }
    }

    /// Table holding `count` records keyed `rec-0000`, `rec-0001`, ...
    pub fn with_unmarked_records(count: usize) -> Self {
        let table = Self::new();
        for index in 0..count {
            table.insert(sample_record(index));
        }
        table
    }

    /// Natural page size used when a scan request carries no limit.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size.max(1));
        self
    }

    /// Fails the `call`-th scan (1-based) with `message`.
    pub fn fail_scan_on_call(mut self, call: usize, message: &str) -> Self {
        self.scan_failure = Some(Injection {
            call,
            message: message.to_string(),
        });
        self
    }

    /// Fails the `call`-th batch write (1-based) with `message`, leaving the
    /// batch unapplied.
    pub fn fail_write_on_call(mut self, call: usize, message: &str) -> Self {
        self.write_failure = Some(Injection {
            call,
            message: message.to_string(),
        });
        self
    }

    /// Advances `clock` by `latency` on every batch write.
    pub fn with_write_latency(mut self, clock: Arc<ManualClock>, latency: Duration) -> Self {
        self.write_latency = Some((clock, latency));
        self
    }

    pub fn insert(&self, record: JsonRecord) {
        let key = record_key(&record).expect("test record must carry a string pk");
        self.lock().records.insert(key, record);
    }

    pub fn key_for(index: usize) -> String {
        format!("rec-{index:04}")
    }

    pub fn token_for(index: usize) -> ContinuationToken {
        token_for_key(&Self::key_for(index))
    }

    pub fn records(&self) -> Vec<JsonRecord> {
        self.lock().records.values().cloned().collect()
    }

    pub fn marked_keys_with(&self, attribute: &str) -> Vec<String> {
        self.lock()
            .records
            .iter()
            .filter(|(_, record)| record.contains_key(attribute))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn marked_keys(&self) -> Vec<String> {
        self.marked_keys_with(crate::contract::DEFAULT_MARKER_ATTRIBUTE)
    }

    pub fn unmarked_keys(&self) -> Vec<String> {
        self.lock()
            .records
            .iter()
            .filter(|(_, record)| !record.contains_key(crate::contract::DEFAULT_MARKER_ATTRIBUTE))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn scan_calls(&self) -> usize {
        self.lock().scan_calls
    }

    pub fn write_calls(&self) -> usize {
        self.lock().write_calls
    }

    pub fn written_batch_sizes(&self) -> Vec<usize> {
        self.lock().written_batch_sizes.clone()
    }

    pub fn scanned_tokens(&self) -> Vec<Option<ContinuationToken>> {
        self.lock().scanned_tokens.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        self.state.lock().expect("poisoned mutex")
    }
}

impl Default for InMemoryTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationTable for InMemoryTable {
    type Record = JsonRecord;

    fn scan_unmigrated(&self, request: ScanRequest<'_>) -> Result<Page<JsonRecord>, StorageError> {
        let mut state = self.lock();
        state.scan_calls += 1;
        state.scanned_tokens.push(request.start_token.cloned());

        if let Some(injection) = &self.scan_failure {
            if injection.call == state.scan_calls {
                return Err(StorageError::Scan(injection.message.clone()));
            }
        }

        let start_after = match request.start_token {
            Some(token) => Some(
                token
                    .as_map()
                    .get(KEY_ATTRIBUTE)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        StorageError::Token(format!("token is missing string '{KEY_ATTRIBUTE}'"))
                    })?,
            ),
            None => None,
        };

        let limit = request
            .page_size
            .map(|size| size.get() as usize)
            .or(self.page_size)
            .unwrap_or(usize::MAX);

        let mut remaining = state
            .records
            .iter()
            .filter(|(key, _)| start_after.as_ref().map_or(true, |after| *key > after))
            .peekable();

        let mut records = Vec::new();
        let mut last_evaluated = None;
        let mut evaluated = 0usize;
        while evaluated < limit {
            let Some((key, record)) = remaining.next() else {
                break;
            };
            evaluated += 1;
            last_evaluated = Some(key.clone());
            if !record.contains_key(request.marker_attribute) {
                records.push(record.clone());
            }
        }

        let next_token = match (last_evaluated, remaining.peek()) {
            (Some(key), Some(_)) => Some(token_for_key(&key)),
            _ => None,
        };

        Ok(Page {
            records,
            next_token,
        })
    }

    fn put_batch(&self, records: Vec<JsonRecord>) -> Result<(), StorageError> {
        if let Some((clock, latency)) = &self.write_latency {
            clock.advance(*latency);
        }

        let mut state = self.lock();
        state.write_calls += 1;

        if let Some(injection) = &self.write_failure {
            if injection.call == state.write_calls {
                return Err(StorageError::Write(injection.message.clone()));
            }
        }

        state.written_batch_sizes.push(records.len());
        for record in records {
            let key = record_key(&record).ok_or_else(|| {
                StorageError::Write(format!("record is missing string '{KEY_ATTRIBUTE}'"))
            })?;
            state.records.insert(key, record);
        }
        Ok(())
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("poisoned mutex");
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().expect("poisoned mutex")
    }
}

pub fn sample_record(index: usize) -> JsonRecord {
    JsonRecord::from([
        (
            KEY_ATTRIBUTE.to_string(),
            Value::String(InMemoryTable::key_for(index)),
        ),
        ("payload".to_string(), Value::from(index as u64)),
    ])
}

fn token_for_key(key: &str) -> ContinuationToken {
    let map = Map::from_iter([(KEY_ATTRIBUTE.to_string(), Value::String(key.to_string()))]);
    ContinuationToken::from_map(map).expect("key map is never empty")
}

fn record_key(record: &JsonRecord) -> Option<String> {
    record
        .get(KEY_ATTRIBUTE)
        .and_then(Value::as_str)
        .map(str::to_string)
}
