//! Command validation
//!
//! Validation is pure: it never touches the ledger or an executor, and the
//! validate-only and execute paths both call [`validate`] so they cannot
//! disagree on what they accept.

use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{CapabilityId, Command, RawCommand, RiskLevel};

/// Minimum idempotency key length in characters
pub const IDEMPOTENCY_KEY_MIN: usize = 8;

/// Maximum idempotency key length in characters
pub const IDEMPOTENCY_KEY_MAX: usize = 128;

/// A command envelope field failed validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    /// Envelope field name as sent on the wire
    pub field: &'static str,
    /// Human-readable reason
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Validate a raw envelope into a [`Command`]
///
/// A missing `id` is generated here.
///
/// # Errors
///
/// Returns the first [`ValidationError`] encountered, naming the field
pub fn validate(raw: RawCommand) -> Result<Command, ValidationError> {
    let id = match raw.id {
        None => Uuid::new_v4(),
        Some(Value::String(s)) => Uuid::parse_str(&s)
            .map_err(|_| ValidationError::new("id", "must be a UUID"))?,
        Some(_) => return Err(ValidationError::new("id", "must be a UUID string")),
    };

    let device_id = required_string(raw.device_id, "deviceId")?;
    if device_id.is_empty() {
        return Err(ValidationError::new("deviceId", "must not be empty"));
    }

    let capability: CapabilityId = required_string(raw.capability, "capability")?
        .parse()
        .map_err(|e: super::InvalidCapability| ValidationError::new("capability", e.to_string()))?;

    let params = match raw.params {
        None => return Err(ValidationError::new("params", "field required")),
        Some(value) => object(value, "params")?,
    };

    let deadline = optional_string(raw.deadline, "deadline")?
        .map(|s| parse_deadline(&s))
        .transpose()?;

    let idempotency_key = optional_string(raw.idempotency_key, "idempotencyKey")?;
    if let Some(key) = &idempotency_key {
        let len = key.chars().count();
        if !(IDEMPOTENCY_KEY_MIN..=IDEMPOTENCY_KEY_MAX).contains(&len) {
            return Err(ValidationError::new(
                "idempotencyKey",
                format!(
                    "must be {IDEMPOTENCY_KEY_MIN}-{IDEMPOTENCY_KEY_MAX} characters, got {len}"
                ),
            ));
        }
    }

    let risk_level = match optional_string(raw.risk_level, "riskLevel")? {
        None => RiskLevel::default(),
        Some(s) => RiskLevel::parse(&s).ok_or_else(|| {
            ValidationError::new("riskLevel", "must be one of low, medium, high")
        })?,
    };

    let metadata = match raw.metadata {
        None | Some(Value::Null) => Map::new(),
        Some(value) => object(value, "metadata")?,
    };

    Ok(Command {
        id,
        device_id,
        capability,
        params,
        deadline,
        idempotency_key,
        risk_level,
        metadata,
    })
}

fn required_string(value: Option<Value>, field: &'static str) -> Result<String, ValidationError> {
    optional_string(value, field)?.ok_or_else(|| ValidationError::new(field, "field required"))
}

fn optional_string(
    value: Option<Value>,
    field: &'static str,
) -> Result<Option<String>, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ValidationError::new(field, "must be a string")),
    }
}

fn object(value: Value, field: &'static str) -> Result<Map<String, Value>, ValidationError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ValidationError::new(field, "must be an object")),
    }
}

/// Parse an RFC 3339 deadline; a timestamp without an offset is rejected
fn parse_deadline(s: &str) -> Result<DateTime<chrono::FixedOffset>, ValidationError> {
    DateTime::parse_from_rfc3339(s).map_err(|_| {
        let naive = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .any(|fmt| NaiveDateTime::parse_from_str(s, fmt).is_ok());
        if naive {
            ValidationError::new("deadline", "must carry a timezone offset")
        } else {
            ValidationError::new("deadline", "must be an RFC 3339 timestamp")
        }
    })
}
