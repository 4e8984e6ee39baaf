//! # Event
//!
//! The record flowing through the pipeline and the per-item validation applied at admission.
use chrono::{DateTime, FixedOffset, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Width of the `topic` and `event_id` columns.
pub const MAX_KEY_LENGTH: usize = 255;

/// An admitted event. `(topic, event_id)` identifies it; everything else belongs to the first
/// copy that reaches the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub topic: String,
    /// Canonical text form: integer ids are stored as their decimal representation.
    pub event_id: String,
    pub source: Option<String>,
    pub payload: Map<String, Value>,
    /// Producer clock, used for read ordering.
    pub source_timestamp: DateTime<Utc>,
    /// Gateway clock, stamped at admission. Never used for ordering.
    pub received_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn dedup_key(&self) -> (&str, &str) {
        (&self.topic, &self.event_id)
    }
}

/// Why a single submitted item was rejected. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event must be a JSON object")]
    NotAnObject,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("field '{0}' must not be blank")]
    Blank(&'static str),
    #[error("field '{field}' is longer than {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("'{0}' is not an ISO-8601 timestamp")]
    InvalidTimestamp(String),
    #[error("field '{0}' must not contain NUL characters")]
    NulCharacter(&'static str),
}

/// Validate one submitted item and turn it into an `EventRecord` stamped with `received_at`.
///
/// The item may carry its producer time as `timestamp` or `source_timestamp`. Unknown fields
/// are ignored. Both timestamps are truncated to microseconds, the precision the store keeps.
pub fn validate(item: Value, received_at: DateTime<Utc>) -> Result<EventRecord, ValidationError> {
    let Value::Object(mut fields) = item else {
        return Err(ValidationError::NotAnObject);
    };

    let topic = match take(&mut fields, "topic")? {
        Value::String(topic) => topic,
        _ => {
            return Err(ValidationError::WrongType {
                field: "topic",
                expected: "a string",
            })
        }
    };
    check_key("topic", &topic)?;

    let event_id = match take(&mut fields, "event_id")? {
        Value::String(event_id) => event_id,
        Value::Number(n) if n.is_i64() || n.is_u64() => n.to_string(),
        _ => {
            return Err(ValidationError::WrongType {
                field: "event_id",
                expected: "a string or an integer",
            })
        }
    };
    check_key("event_id", &event_id)?;

    let raw_timestamp = match fields.remove("timestamp") {
        Some(Value::Null) | None => take(&mut fields, "source_timestamp")
            .map_err(|_| ValidationError::MissingField("timestamp"))?,
        Some(value) => value,
    };
    let source_timestamp = match raw_timestamp {
        Value::String(raw) => parse_timestamp(&raw)?.trunc_subsecs(6),
        _ => {
            return Err(ValidationError::WrongType {
                field: "timestamp",
                expected: "a string",
            })
        }
    };

    let payload = match take(&mut fields, "payload")? {
        Value::Object(payload) => payload,
        _ => {
            return Err(ValidationError::WrongType {
                field: "payload",
                expected: "an object",
            })
        }
    };
    if payload_contains_nul(&payload) {
        return Err(ValidationError::NulCharacter("payload"));
    }

    let source = match fields.remove("source") {
        None | Some(Value::Null) => None,
        Some(Value::String(source)) => Some(source),
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: "source",
                expected: "a string",
            })
        }
    };

    if source.as_deref().is_some_and(|source| source.contains('\0')) {
        return Err(ValidationError::NulCharacter("source"));
    }

    Ok(EventRecord {
        topic,
        event_id,
        source,
        payload,
        source_timestamp,
        received_at: received_at.trunc_subsecs(6),
    })
}

/// Parse an RFC 3339 instant, or a naive ISO-8601 date-time which is taken to be UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    let trimmed = raw.trim();

    if let Ok(with_offset) = trimmed.parse::<DateTime<FixedOffset>>() {
        return Ok(with_offset.with_timezone(&Utc));
    }

    trimmed
        .parse::<NaiveDateTime>()
        .map(|naive| naive.and_utc())
        .map_err(|_| ValidationError::InvalidTimestamp(raw.to_owned()))
}

fn take(fields: &mut Map<String, Value>, name: &'static str) -> Result<Value, ValidationError> {
    match fields.remove(name) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(name)),
        Some(value) => Ok(value),
    }
}

/// Postgres text and jsonb cannot hold U+0000, anywhere in the document.
fn payload_contains_nul(payload: &Map<String, Value>) -> bool {
    payload
        .iter()
        .any(|(key, value)| key.contains('\0') || value_contains_nul(value))
}

fn value_contains_nul(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains('\0'),
        Value::Array(items) => items.iter().any(value_contains_nul),
        Value::Object(fields) => payload_contains_nul(fields),
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}

fn check_key(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Blank(field));
    }
    if value.contains('\0') {
        return Err(ValidationError::NulCharacter(field));
    }
    if value.chars().count() > MAX_KEY_LENGTH {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_KEY_LENGTH,
        });
    }
    Ok(())
}
