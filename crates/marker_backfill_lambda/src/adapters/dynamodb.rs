use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::{AttributeValue, PutRequest, WriteRequest};
use marker_backfill_core::contract::{ContinuationToken, MigrationMarker};
use marker_backfill_core::storage::{
    MigrationRecord, MigrationTable, Page, ScanRequest, StorageError,
};
use serde_json::{Map, Value};

/// BatchWriteItem accepts at most 25 put requests per call.
pub const MAX_BATCH_WRITE_ITEMS: usize = 25;
pub const DEFAULT_MAX_WRITE_ATTEMPTS: usize = 5;
const UNPROCESSED_BACKOFF_BASE: Duration = Duration::from_millis(50);
const MARKER_NAME_PLACEHOLDER: &str = "#marker";

#[derive(Debug, Clone, PartialEq)]
pub struct DynamoRecord(pub HashMap<String, AttributeValue>);

impl MigrationRecord for DynamoRecord {
    fn set_marker(&mut self, marker: &MigrationMarker) {
        self.0.insert(
            marker.attribute.clone(),
            AttributeValue::S(marker.value.clone()),
        );
    }
}

/// DynamoDB-backed table. Blocks the current Tokio worker for each call, so it
/// must be driven from a multi-threaded runtime.
pub struct DynamoTable {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
    max_write_attempts: usize,
}

impl DynamoTable {
    pub fn new(client: aws_sdk_dynamodb::Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
        }
    }

    async fn scan(&self, request: ScanRequest<'_>) -> Result<Page<DynamoRecord>, StorageError> {
        let (filter_expression, attribute_names) = unmigrated_filter(request.marker_attribute);
        let mut scan = self
            .client
            .scan()
            .table_name(&self.table_name)
            .filter_expression(filter_expression)
            .set_expression_attribute_names(Some(attribute_names));

        if let Some(token) = request.start_token {
            scan = scan.set_exclusive_start_key(Some(token_to_key(token)?));
        }
        if let Some(page_size) = request.page_size {
            let limit = i32::try_from(page_size.get()).unwrap_or(i32::MAX);
            scan = scan.limit(limit);
        }

        let output = scan.send().await.map_err(|error| {
            StorageError::Scan(format!(
                "failed to scan table {}: {}",
                self.table_name,
                DisplayErrorContext(&error)
            ))
        })?;

        let records = output
            .items
            .unwrap_or_default()
            .into_iter()
            .map(DynamoRecord)
            .collect();
        let next_token = match output.last_evaluated_key {
            Some(key) => key_to_token(key)?,
            None => None,
        };

        Ok(Page {
            records,
            next_token,
        })
    }

    async fn write_chunk(&self, chunk: Vec<DynamoRecord>) -> Result<(), StorageError> {
        let pending = chunk
            .into_iter()
            .map(|record| {
                PutRequest::builder()
                    .set_item(Some(record.0))
                    .build()
                    .map(|put| WriteRequest::builder().put_request(put).build())
                    .map_err(|error| {
                        StorageError::Write(format!("failed to build put request: {error}"))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let table_name = self.table_name.as_str();
        resubmit_unprocessed(
            table_name,
            pending,
            self.max_write_attempts,
            UNPROCESSED_BACKOFF_BASE,
            |batch| {
                let request = self.client.batch_write_item().request_items(table_name, batch);
                async move {
                    let output = request.send().await.map_err(|error| {
                        StorageError::Write(format!(
                            "failed to batch write to table {table_name}: {}",
                            DisplayErrorContext(&error)
                        ))
                    })?;
                    let unprocessed = output
                        .unprocessed_items
                        .and_then(|mut unprocessed| unprocessed.remove(table_name))
                        .unwrap_or_default();
                    Ok::<_, StorageError>(unprocessed)
                }
            },
        )
        .await
    }
}

impl MigrationTable for DynamoTable {
    type Record = DynamoRecord;

    fn scan_unmigrated(
        &self,
        request: ScanRequest<'_>,
    ) -> Result<Page<DynamoRecord>, StorageError> {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(self.scan(request))
        })
    }

    fn put_batch(&self, records: Vec<DynamoRecord>) -> Result<(), StorageError> {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async {
                for chunk in write_chunks(records) {
                    self.write_chunk(chunk).await?;
                }
                Ok::<(), StorageError>(())
            })
        })
    }
}

/// Filter expression and name bindings selecting records without the marker.
fn unmigrated_filter(marker_attribute: &str) -> (String, HashMap<String, String>) {
    (
        format!("attribute_not_exists({MARKER_NAME_PLACEHOLDER})"),
        HashMap::from([(
            MARKER_NAME_PLACEHOLDER.to_string(),
            marker_attribute.to_string(),
        )]),
    )
}

/// Splits a page into BatchWriteItem-sized chunks, preserving order.
fn write_chunks<R>(records: Vec<R>) -> Vec<Vec<R>> {
    let mut chunks = Vec::with_capacity(records.len().div_ceil(MAX_BATCH_WRITE_ITEMS));
    let mut records = records.into_iter().peekable();
    while records.peek().is_some() {
        chunks.push(records.by_ref().take(MAX_BATCH_WRITE_ITEMS).collect());
    }
    chunks
}

/// Sends `pending` and resubmits whatever comes back unprocessed, backing off
/// between attempts. `send` returns the requests the service did not apply.
async fn resubmit_unprocessed<W, F, Fut>(
    table_name: &str,
    mut pending: Vec<W>,
    max_attempts: usize,
    backoff_base: Duration,
    mut send: F,
) -> Result<(), StorageError>
where
    F: FnMut(Vec<W>) -> Fut,
    Fut: Future<Output = Result<Vec<W>, StorageError>>,
{
    let mut attempt = 0usize;
    while !pending.is_empty() {
        attempt += 1;
        if attempt > max_attempts {
            return Err(StorageError::Write(format!(
                "{} items remained unprocessed in table {table_name} after {max_attempts} attempts",
                pending.len()
            )));
        }
        if attempt > 1 {
            tokio::time::sleep(unprocessed_backoff(backoff_base, attempt - 1)).await;
        }

        pending = send(pending).await?;
    }

    Ok(())
}

fn unprocessed_backoff(base: Duration, retry: usize) -> Duration {
    let exponent = u32::try_from(retry.saturating_sub(1)).unwrap_or(u32::MAX).min(6);
    base * 2u32.pow(exponent)
}

/// Encodes a key map as `{"attr": {"S": ".."}}` / `{"attr": {"N": ".."}}`.
/// Primary keys may also be binary; those are rejected.
pub fn key_to_token(
    key: HashMap<String, AttributeValue>,
) -> Result<Option<ContinuationToken>, StorageError> {
    let mut map = Map::new();
    for (name, value) in key {
        let encoded = match value {
            AttributeValue::S(text) => serde_json::json!({ "S": text }),
            AttributeValue::N(number) => serde_json::json!({ "N": number }),
            _ => {
                return Err(StorageError::Token(format!(
                    "key attribute '{name}' has an unsupported type; only S and N keys can be checkpointed"
                )))
            }
        };
        map.insert(name, encoded);
    }
    Ok(ContinuationToken::from_map(map))
}

pub fn token_to_key(
    token: &ContinuationToken,
) -> Result<HashMap<String, AttributeValue>, StorageError> {
    token
        .as_map()
        .iter()
        .map(|(name, value)| {
            decode_key_attribute(name, value).map(|decoded| (name.clone(), decoded))
        })
        .collect()
}

fn decode_key_attribute(name: &str, value: &Value) -> Result<AttributeValue, StorageError> {
    let typed = value.as_object().filter(|object| object.len() == 1);
    let decoded = typed.and_then(|object| {
        object.iter().next().and_then(|(kind, raw)| {
            let raw = raw.as_str()?.to_string();
            match kind.as_str() {
                "S" => Some(AttributeValue::S(raw)),
                "N" => Some(AttributeValue::N(raw)),
                _ => None,
            }
        })
    });

    decoded.ok_or_else(|| {
        StorageError::Token(format!(
            "key attribute '{name}' must be {{\"S\": string}} or {{\"N\": string}}, got {value}"
        ))
    })
}
