use std::num::NonZeroU32;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use marker_backfill_core::contract::{
    ContinuationToken, MigrationEvent, MigrationMarker, RunResult, DEFAULT_MARKER_ATTRIBUTE,
    DEFAULT_MARKER_VALUE,
};
use marker_backfill_core::deadline::SystemClock;
use marker_backfill_lambda::adapters::dynamodb::DynamoTable;
use marker_backfill_lambda::config::{normalize_batch_limit, MigrationConfig};
use marker_backfill_lambda::handlers::migrate::{handle_migration_event, TimeBudget};

// ── CLI definition ─────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "migrate_local",
    about = "Run marker backfill passes against a DynamoDB table from a workstation",
    long_about = "Runs the same bounded migration pass as the Lambda entry point.\n\
                  Each pass prints its run result as JSON; with --until-exhausted\n\
                  the returned LastEvaluatedKey is fed into the next pass."
)]
struct Cli {
    /// Table to migrate
    #[arg(long, env = "TABLE_NAME")]
    table: String,
    /// Pages per pass (0 or negative means unlimited)
    #[arg(long, env = "BATCH_LIMIT", default_value_t = 0, allow_negative_numbers = true)]
    batch_limit: i64,
    /// Resume token as JSON (a previous LastEvaluatedKey)
    #[arg(long)]
    start_token: Option<String>,
    /// Scan page size forwarded as the scan Limit
    #[arg(long, env = "SCAN_PAGE_SIZE")]
    scan_page_size: Option<NonZeroU32>,
    /// Wall-clock budget per pass, in seconds
    #[arg(long, default_value_t = 900)]
    time_budget_secs: u64,
    /// Stop accepting new pages this long before the budget runs out
    #[arg(long, env = "DEADLINE_MARGIN_MS", default_value_t = 5_000)]
    deadline_margin_ms: u64,
    #[arg(long, env = "MARKER_ATTRIBUTE", default_value = DEFAULT_MARKER_ATTRIBUTE)]
    marker_attribute: String,
    #[arg(long, env = "MARKER_VALUE", default_value = DEFAULT_MARKER_VALUE)]
    marker_value: String,
    /// Keep running passes until the table is exhausted
    #[arg(long)]
    until_exhausted: bool,
}

impl Cli {
    fn migration_config(&self) -> MigrationConfig {
        MigrationConfig {
            batch_limit: normalize_batch_limit(self.batch_limit),
            scan_page_size: self.scan_page_size,
            deadline_margin: Duration::from_millis(self.deadline_margin_ms),
            marker: MigrationMarker::new(&self.marker_attribute, &self.marker_value),
            ..MigrationConfig::new(&self.table)
        }
    }
}

fn parse_start_token(raw: Option<&str>) -> Result<Option<ContinuationToken>, String> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let key: serde_json::Map<String, serde_json::Value> = serde_json::from_str(raw)
        .map_err(|error| format!("--start-token must be a JSON object: {error}"))?;
    Ok(ContinuationToken::from_map(key))
}

fn print_result(result: &RunResult) {
    match serde_json::to_string(result) {
        Ok(line) => println!("{line}"),
        Err(error) => eprintln!("failed to serialize run result: {error}"),
    }
}

// ── main ───────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = cli.migration_config();
    let mut token = match parse_start_token(cli.start_token.as_deref()) {
        Ok(value) => value,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };

    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let table = DynamoTable::new(
        aws_sdk_dynamodb::Client::new(&aws_config),
        config.table_name.clone(),
    );
    let budget = Duration::from_secs(cli.time_budget_secs);

    loop {
        let event = match serde_json::to_value(MigrationEvent {
            start_token: token.take(),
            batch_limit: None,
        }) {
            Ok(value) => value,
            Err(error) => {
                eprintln!("failed to build migration event: {error}");
                return ExitCode::FAILURE;
            }
        };

        let pass_budget = TimeBudget::measure(&SystemClock, budget);
        match handle_migration_event(event, &config, &table, &SystemClock, pass_budget, None) {
            Ok(summary) => {
                token = summary.next_token.clone();
                print_result(&RunResult::Success(summary));
            }
            Err(error) => {
                print_result(&RunResult::error(error.to_string()));
                return ExitCode::FAILURE;
            }
        }

        if token.is_none() || !cli.until_exhausted {
            return ExitCode::SUCCESS;
        }
    }
}
