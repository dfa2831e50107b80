use std::time::{Duration, Instant};

use marker_backfill_core::contract::{
    ContinuationToken, MigrationEvent, RunResult, RunSummary, CONTINUATION_TOKEN_FIELD,
};
use marker_backfill_core::deadline::{Clock, Deadline};
use marker_backfill_core::driver::MigrationDriver;
use marker_backfill_core::storage::MigrationTable;
use serde_json::{json, Value};
use thiserror::Error;

use crate::adapters::invoke::ContinuationInvoker;
use crate::config::{normalize_batch_limit, MigrationConfig};
use crate::logging::{log_error, log_info};

const COMPONENT: &str = "migration_handler";
pub const COMPLETION_MESSAGE: &str = "Migration completed successfully.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationHandlerError {
    #[error("invalid migration event: {0}")]
    InvalidEvent(String),
    #[error("{0}")]
    RunFailed(String),
    #[error("failed to dispatch continuation: {0}")]
    ContinuationFailed(String),
}

/// Time left before the invoking platform's hard cutoff, anchored at the
/// instant it was read. Setup work done after the measurement (client
/// construction, config loading) comes out of the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBudget {
    pub remaining: Duration,
    pub measured_at: Instant,
}

impl TimeBudget {
    pub fn measure<C: Clock>(clock: &C, remaining: Duration) -> Self {
        Self {
            remaining,
            measured_at: clock.now(),
        }
    }

    pub fn deadline(&self, margin: Duration) -> Deadline {
        Deadline::from_remaining(self.measured_at, self.remaining, margin)
    }
}

/// Runs one bounded migration pass for an invocation event.
///
/// The deadline handed to the driver is the budget minus the configured
/// margin. A failed run is returned as an error so the invoking layer can
/// decide whether to re-invoke with the same start token.
pub fn handle_migration_event<T: MigrationTable, C: Clock>(
    event: Value,
    config: &MigrationConfig,
    table: &T,
    clock: &C,
    budget: TimeBudget,
    continuation: Option<&dyn ContinuationInvoker>,
) -> Result<RunSummary, MigrationHandlerError> {
    let started_at = Instant::now();
    let event = parse_event(event)?;
    let batch_limit = event
        .batch_limit
        .map(normalize_batch_limit)
        .unwrap_or(config.batch_limit);
    let deadline = budget.deadline(config.deadline_margin);

    log_info(
        COMPONENT,
        "migration_started",
        json!({
            "table": config.table_name.clone(),
            "batch_limit": batch_limit,
            "start_token": token_fingerprint(event.start_token.as_ref()),
            "remaining_ms": budget.remaining.as_millis(),
            "deadline_margin_ms": config.deadline_margin.as_millis(),
        }),
    );

    let driver =
        MigrationDriver::new(table, &config.marker, clock).with_page_size(config.scan_page_size);
    let result = driver.run_with_progress(event.start_token, batch_limit, deadline, &mut |report| {
        log_info(
            COMPONENT,
            "page_processed",
            json!({
                "table": config.table_name.clone(),
                "page": report.page_number,
                "records_written": report.records_written,
                "next_token": token_fingerprint(report.next_token),
            }),
        );
    });

    let summary = match result {
        RunResult::Success(summary) => summary,
        RunResult::Error { message } => {
            log_error(
                COMPONENT,
                "migration_failed",
                json!({
                    "table": config.table_name.clone(),
                    "duration_ms": started_at.elapsed().as_millis(),
                    "error": message.clone(),
                }),
            );
            return Err(MigrationHandlerError::RunFailed(message));
        }
    };

    log_info(
        COMPONENT,
        "migration_completed",
        json!({
            "message": COMPLETION_MESSAGE,
            "table": config.table_name.clone(),
            "batches_processed": summary.batches_processed,
            "records_migrated": summary.records_migrated,
            "stop_reason": summary.stop_reason.as_str(),
            "next_token": token_fingerprint(summary.next_token.as_ref()),
            "duration_ms": started_at.elapsed().as_millis(),
            "deadline_headroom_ms": deadline
                .remaining(clock.now())
                .map(|headroom| headroom.as_millis()),
        }),
    );

    if let (Some(token), Some(invoker)) = (summary.next_token.as_ref(), continuation) {
        dispatch_continuation(token, invoker)?;
    }

    Ok(summary)
}

/// Accepts the plain event, a `null` event, or a Step Functions style
/// `{"Payload": {...}}` wrapper around a previous run result. Fields set next
/// to the wrapper (such as `batch_limit`) apply unless the payload sets them
/// too.
fn parse_event(event: Value) -> Result<MigrationEvent, MigrationHandlerError> {
    let payload = match event {
        Value::Null => json!({}),
        Value::Object(mut object) => {
            let wrapped = !object.contains_key(CONTINUATION_TOKEN_FIELD)
                && object.get("Payload").is_some_and(Value::is_object);
            match object.remove("Payload") {
                Some(Value::Object(mut inner)) if wrapped => {
                    for (field, value) in object {
                        inner.entry(field).or_insert(value);
                    }
                    Value::Object(inner)
                }
                Some(inner) => {
                    object.insert("Payload".to_string(), inner);
                    Value::Object(object)
                }
                None => Value::Object(object),
            }
        }
        _ => {
            return Err(MigrationHandlerError::InvalidEvent(
                "event payload must be a JSON object".to_string(),
            ))
        }
    };

    serde_json::from_value(payload)
        .map_err(|error| MigrationHandlerError::InvalidEvent(error.to_string()))
}

fn dispatch_continuation(
    token: &ContinuationToken,
    invoker: &dyn ContinuationInvoker,
) -> Result<(), MigrationHandlerError> {
    let payload = serde_json::to_vec(&MigrationEvent::resume_from(token.clone()))
        .map_err(|error| MigrationHandlerError::ContinuationFailed(error.to_string()))?;

    if let Err(error) = invoker.invoke_async(&payload) {
        log_error(
            COMPONENT,
            "continuation_failed",
            json!({
                "next_token": token.fingerprint(),
                "error": error.clone(),
            }),
        );
        return Err(MigrationHandlerError::ContinuationFailed(error));
    }

    log_info(
        COMPONENT,
        "continuation_dispatched",
        json!({ "next_token": token.fingerprint() }),
    );
    Ok(())
}

fn token_fingerprint(token: Option<&ContinuationToken>) -> Value {
    token
        .map(|token| Value::from(token.fingerprint()))
        .unwrap_or(Value::Null)
}
