use std::time::Duration;

use aws_sdk_lambda::types::InvocationType;
use chrono::Utc;
use lambda_runtime::{service_fn, Error, LambdaEvent};
use marker_backfill_core::contract::RunResult;
use marker_backfill_core::deadline::SystemClock;
use marker_backfill_lambda::adapters::dynamodb::DynamoTable;
use marker_backfill_lambda::adapters::invoke::ContinuationInvoker;
use marker_backfill_lambda::config::MigrationConfig;
use marker_backfill_lambda::handlers::migrate::{handle_migration_event, TimeBudget};
use serde_json::Value;

struct AwsLambdaContinuationInvoker {
    lambda_client: aws_sdk_lambda::Client,
    function_name: String,
}

impl ContinuationInvoker for AwsLambdaContinuationInvoker {
    fn invoke_async(&self, payload: &[u8]) -> Result<(), String> {
        let request_payload = payload.to_vec();
        let client = self.lambda_client.clone();
        let function_name = self.function_name.clone();

        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                client
                    .invoke()
                    .function_name(function_name)
                    .invocation_type(InvocationType::Event)
                    .set_payload(Some(request_payload.into()))
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|error| format!("failed to invoke continuation lambda: {error}"))
            })
        })
    }
}

async fn handle_request(event: LambdaEvent<Value>) -> Result<Value, Error> {
    let budget = TimeBudget::measure(
        &SystemClock,
        remaining_time(event.context.deadline, Utc::now().timestamp_millis()),
    );
    let config = MigrationConfig::from_env().map_err(|error| Error::from(error.to_string()))?;

    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let table = DynamoTable::new(
        aws_sdk_dynamodb::Client::new(&aws_config),
        config.table_name.clone(),
    );
    let invoker = config
        .continuation_function_arn
        .as_ref()
        .map(|arn| AwsLambdaContinuationInvoker {
            lambda_client: aws_sdk_lambda::Client::new(&aws_config),
            function_name: arn.clone(),
        });

    let summary = handle_migration_event(
        event.payload,
        &config,
        &table,
        &SystemClock,
        budget,
        invoker
            .as_ref()
            .map(|value| value as &dyn ContinuationInvoker),
    )
    .map_err(|error| Error::from(error.to_string()))?;

    serde_json::to_value(RunResult::Success(summary))
        .map_err(|error| Error::from(format!("failed to serialize run result: {error}")))
}

/// Time left before the invocation deadline (epoch milliseconds).
fn remaining_time(deadline_ms: u64, now_ms: i64) -> Duration {
    let now_ms = u64::try_from(now_ms).unwrap_or(0);
    Duration::from_millis(deadline_ms.saturating_sub(now_ms))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    lambda_runtime::run(service_fn(handle_request)).await
}
