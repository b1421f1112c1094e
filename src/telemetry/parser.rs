use crate::telemetry::collector::RawSample;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Field names shared by the serialized record format and the store columns.
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const CPU_FIELD: &str = "cpu_percent";
pub const MEMORY_FIELD: &str = "memory_percent";
pub const DISK_FIELD: &str = "disk_percent";

const REQUIRED_FIELDS: [&str; 4] = [TIMESTAMP_FIELD, CPU_FIELD, MEMORY_FIELD, DISK_FIELD];

/// A fully validated metrics sample, ready to be persisted.
///
/// Percentages are carried through exactly as reported; values outside
/// `0.0..=100.0` are accepted.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CanonicalRecord {
    #[serde(rename = "timestamp")]
    pub collected_at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

/// The shapes a record may arrive in.
#[derive(Debug, Clone)]
pub enum ParseInput {
    /// A sample straight from the collector.
    Raw(RawSample),
    /// JSON text, e.g. a line read back from the structured log.
    Text(String),
    /// An already-decoded JSON mapping.
    Value(Value),
}

impl From<RawSample> for ParseInput {
    fn from(sample: RawSample) -> Self {
        Self::Raw(sample)
    }
}

impl From<&str> for ParseInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for ParseInput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Value> for ParseInput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid timestamp {value:?}")]
    InvalidTimestamp { value: String },
}

/// Validate and normalize one record.
///
/// Checks run in order and stop at the first failure: decode (text only),
/// field presence, timestamp. Every rejection is logged before it is
/// returned so callers only need to decide whether to continue.
pub fn parse(input: impl Into<ParseInput>) -> Result<CanonicalRecord, ParseError> {
    let result = match input.into() {
        ParseInput::Raw(sample) => from_raw(sample),
        ParseInput::Text(text) => serde_json::from_str::<Value>(&text)
            .map_err(|e| ParseError::Malformed(e.to_string()))
            .and_then(from_value),
        ParseInput::Value(value) => from_value(value),
    };
    if let Err(ref e) = result {
        tracing::warn!(error = %e, "rejected metrics record");
    }
    result
}

fn from_raw(sample: RawSample) -> Result<CanonicalRecord, ParseError> {
    Ok(CanonicalRecord {
        collected_at: parse_timestamp(&sample.collected_at)?,
        cpu_percent: sample.cpu_percent,
        memory_percent: sample.memory_percent,
        disk_percent: sample.disk_percent,
    })
}

fn from_value(value: Value) -> Result<CanonicalRecord, ParseError> {
    let map = match value {
        Value::Object(map) => map,
        other => {
            return Err(ParseError::Malformed(format!(
                "expected a JSON object, got {}",
                kind(&other)
            )))
        }
    };

    for field in REQUIRED_FIELDS {
        if !matches!(map.get(field), Some(v) if !v.is_null()) {
            return Err(ParseError::MissingField(field));
        }
    }

    let collected_at = match &map[TIMESTAMP_FIELD] {
        Value::String(s) => parse_timestamp(s)?,
        other => {
            return Err(ParseError::InvalidTimestamp {
                value: other.to_string(),
            })
        }
    };

    Ok(CanonicalRecord {
        collected_at,
        cpu_percent: number(&map, CPU_FIELD)?,
        memory_percent: number(&map, MEMORY_FIELD)?,
        disk_percent: number(&map, DISK_FIELD)?,
    })
}

fn number(map: &Map<String, Value>, field: &'static str) -> Result<f64, ParseError> {
    map[field]
        .as_f64()
        .ok_or_else(|| ParseError::Malformed(format!("`{field}` is not a number")))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Parse an ISO-8601 timestamp into UTC.
///
/// Offsets are honoured; timestamps without one are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight.and_utc());
    }
    Err(ParseError::InvalidTimestamp {
        value: raw.to_string(),
    })
}
