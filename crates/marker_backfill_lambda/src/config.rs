use std::num::NonZeroU32;
use std::time::Duration;

use marker_backfill_core::contract::{
    MigrationMarker, DEFAULT_MARKER_ATTRIBUTE, DEFAULT_MARKER_VALUE,
};
use marker_backfill_core::deadline::DEFAULT_DEADLINE_MARGIN;
use thiserror::Error;

pub const TABLE_NAME_VAR: &str = "TABLE_NAME";
pub const BATCH_LIMIT_VAR: &str = "BATCH_LIMIT";
pub const SCAN_PAGE_SIZE_VAR: &str = "SCAN_PAGE_SIZE";
pub const DEADLINE_MARGIN_MS_VAR: &str = "DEADLINE_MARGIN_MS";
pub const MARKER_ATTRIBUTE_VAR: &str = "MARKER_ATTRIBUTE";
pub const MARKER_VALUE_VAR: &str = "MARKER_VALUE";
pub const CONTINUATION_FUNCTION_ARN_VAR: &str = "CONTINUATION_FUNCTION_ARN";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be configured")]
    Missing(&'static str),
    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    pub table_name: String,
    /// Pages per invocation; 0 means unlimited.
    pub batch_limit: usize,
    pub scan_page_size: Option<NonZeroU32>,
    pub deadline_margin: Duration,
    pub marker: MigrationMarker,
    pub continuation_function_arn: Option<String>,
}

impl MigrationConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            batch_limit: 0,
            scan_page_size: None,
            deadline_margin: DEFAULT_DEADLINE_MARGIN,
            marker: MigrationMarker::default(),
            continuation_function_arn: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let table_name =
            non_blank(lookup(TABLE_NAME_VAR)).ok_or(ConfigError::Missing(TABLE_NAME_VAR))?;

        let raw_batch_limit =
            non_blank(lookup(BATCH_LIMIT_VAR)).ok_or(ConfigError::Missing(BATCH_LIMIT_VAR))?;
        let batch_limit =
            normalize_batch_limit(parse_number::<i64>(BATCH_LIMIT_VAR, &raw_batch_limit)?);

        let scan_page_size = match non_blank(lookup(SCAN_PAGE_SIZE_VAR)) {
            Some(raw) => Some(parse_number::<NonZeroU32>(SCAN_PAGE_SIZE_VAR, &raw)?),
            None => None,
        };

        let deadline_margin = match non_blank(lookup(DEADLINE_MARGIN_MS_VAR)) {
            Some(raw) => Duration::from_millis(parse_number::<u64>(DEADLINE_MARGIN_MS_VAR, &raw)?),
            None => DEFAULT_DEADLINE_MARGIN,
        };

        let marker = MigrationMarker::new(
            non_blank(lookup(MARKER_ATTRIBUTE_VAR))
                .unwrap_or_else(|| DEFAULT_MARKER_ATTRIBUTE.to_string()),
            non_blank(lookup(MARKER_VALUE_VAR)).unwrap_or_else(|| DEFAULT_MARKER_VALUE.to_string()),
        );

        Ok(Self {
            table_name,
            batch_limit,
            scan_page_size,
            deadline_margin,
            marker,
            continuation_function_arn: non_blank(lookup(CONTINUATION_FUNCTION_ARN_VAR)),
        })
    }
}

/// Negative limits are treated as "unlimited".
pub fn normalize_batch_limit(raw: i64) -> usize {
    usize::try_from(raw).unwrap_or(0)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn parse_number<N>(name: &'static str, raw: &str) -> Result<N, ConfigError>
where
    N: std::str::FromStr,
    N::Err: std::fmt::Display,
{
    raw.parse::<N>().map_err(|error| ConfigError::Invalid {
        name,
        value: raw.to_string(),
        reason: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| values.get(name).cloned()
    }

    #[test]
    fn minimal_environment_uses_defaults() {
        let config = MigrationConfig::from_lookup(lookup_from(&[
            ("TABLE_NAME", "orders"),
            ("BATCH_LIMIT", "10"),
        ]))
        .expect("config should load");

        assert_eq!(config.table_name, "orders");
        assert_eq!(config.batch_limit, 10);
        assert_eq!(config.scan_page_size, None);
        assert_eq!(config.deadline_margin, DEFAULT_DEADLINE_MARGIN);
        assert_eq!(config.marker, MigrationMarker::default());
        assert_eq!(config.continuation_function_arn, None);
    }

    #[test]
    fn negative_batch_limit_means_unlimited() {
        let config = MigrationConfig::from_lookup(lookup_from(&[
            ("TABLE_NAME", "orders"),
            ("BATCH_LIMIT", "-3"),
        ]))
        .expect("config should load");
        assert_eq!(config.batch_limit, 0);
    }

    #[test]
    fn missing_table_name_is_reported() {
        let error = MigrationConfig::from_lookup(lookup_from(&[("BATCH_LIMIT", "1")]))
            .expect_err("config should fail");
        assert_eq!(error.to_string(), "TABLE_NAME must be configured");
    }

    #[test]
    fn missing_batch_limit_is_reported() {
        let error = MigrationConfig::from_lookup(lookup_from(&[("TABLE_NAME", "orders")]))
            .expect_err("config should fail");
        assert_eq!(error, ConfigError::Missing("BATCH_LIMIT"));
    }

    #[test]
    fn non_numeric_batch_limit_is_rejected() {
        let error = MigrationConfig::from_lookup(lookup_from(&[
            ("TABLE_NAME", "orders"),
            ("BATCH_LIMIT", "lots"),
        ]))
        .expect_err("config should fail");
        assert!(error.to_string().starts_with("BATCH_LIMIT has invalid value 'lots'"));
    }

    #[test]
    fn zero_scan_page_size_is_rejected() {
        let error = MigrationConfig::from_lookup(lookup_from(&[
            ("TABLE_NAME", "orders"),
            ("BATCH_LIMIT", "0"),
            ("SCAN_PAGE_SIZE", "0"),
        ]))
        .expect_err("config should fail");
        assert!(matches!(
            error,
            ConfigError::Invalid {
                name: "SCAN_PAGE_SIZE",
                ..
            }
        ));
    }

    #[test]
    fn optional_settings_are_read() {
        let config = MigrationConfig::from_lookup(lookup_from(&[
            ("TABLE_NAME", " orders "),
            ("BATCH_LIMIT", "4"),
            ("SCAN_PAGE_SIZE", "250"),
            ("DEADLINE_MARGIN_MS", "12000"),
            ("MARKER_ATTRIBUTE", "backfilled_v2"),
            ("MARKER_VALUE", "2026-10"),
            (
                "CONTINUATION_FUNCTION_ARN",
                "arn:aws:lambda:eu-west-1:123456789012:function:backfill",
            ),
        ]))
        .expect("config should load");

        assert_eq!(config.table_name, "orders");
        assert_eq!(config.scan_page_size, NonZeroU32::new(250));
        assert_eq!(config.deadline_margin, Duration::from_secs(12));
        assert_eq!(config.marker, MigrationMarker::new("backfilled_v2", "2026-10"));
        assert!(config
            .continuation_function_arn
            .as_deref()
            .is_some_and(|arn| arn.ends_with(":function:backfill")));
    }
}
