use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub const DEFAULT_MARKER_ATTRIBUTE: &str = "pre_existing_processed";
pub const DEFAULT_MARKER_VALUE: &str = "yes";
pub const CONTINUATION_TOKEN_FIELD: &str = "LastEvaluatedKey";

/// Attribute stamped onto every migrated record. Records carrying the
/// attribute are excluded from every later scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationMarker {
    pub attribute: String,
    pub value: String,
}

impl MigrationMarker {
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }
}

impl Default for MigrationMarker {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER_ATTRIBUTE, DEFAULT_MARKER_VALUE)
    }
}

/// Opaque scan position: the exclusive start key handed back by the storage
/// layer. Absent means "start of table".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ContinuationToken(Map<String, Value>);

impl ContinuationToken {
    /// Returns `None` for an empty key map, which storage layers use
    /// interchangeably with "no more pages".
    pub fn from_map(key: Map<String, Value>) -> Option<Self> {
        if key.is_empty() {
            None
        } else {
            Some(Self(key))
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Stable digest used in log lines instead of raw key values.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(stable_contract_json(&self.0));
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }
}

/// Invocation payload understood by the entry points. Unknown fields are
/// ignored so orchestrators can pass their own bookkeeping through.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MigrationEvent {
    #[serde(
        rename = "LastEvaluatedKey",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_token"
    )]
    pub start_token: Option<ContinuationToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_limit: Option<i64>,
}

impl MigrationEvent {
    pub fn resume_from(token: ContinuationToken) -> Self {
        Self {
            start_token: Some(token),
            batch_limit: None,
        }
    }
}

fn deserialize_optional_token<'de, D>(
    deserializer: D,
) -> Result<Option<ContinuationToken>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let key = Option::<Map<String, Value>>::deserialize(deserializer)?;
    Ok(key.and_then(ContinuationToken::from_map))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The last page carried no continuation token.
    Exhausted,
    BatchLimit,
    Deadline,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::BatchLimit => "batch_limit",
            Self::Deadline => "deadline",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    #[serde(rename = "LastEvaluatedKey")]
    pub next_token: Option<ContinuationToken>,
    pub batches_processed: usize,
    pub records_migrated: usize,
    pub stop_reason: StopReason,
}

impl RunSummary {
    pub fn is_complete(&self) -> bool {
        self.next_token.is_none()
    }
}

/// Outcome of one invocation. A success with a token is fed back as the next
/// invocation's `LastEvaluatedKey`; an error carries no checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunResult {
    Success(RunSummary),
    Error { message: String },
}

impl RunResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn next_token(&self) -> Option<&ContinuationToken> {
        match self {
            Self::Success(summary) => summary.next_token.as_ref(),
            Self::Error { .. } => None,
        }
    }

    pub fn into_result(self) -> Result<RunSummary, String> {
        match self {
            Self::Success(summary) => Ok(summary),
            Self::Error { message } => Err(message),
        }
    }
}

pub fn stable_contract_json(value: impl Serialize) -> String {
    serde_json::to_string(&value).unwrap_or_default()
}
