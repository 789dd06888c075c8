//! Typed access to capability params

use serde_json::{Map, Value};

use super::DispatchError;

type Params = Map<String, Value>;

fn bad(field: &str, reason: &str) -> DispatchError {
    DispatchError::BadParams(format!("{field}: {reason}"))
}

/// Raw value of a required field
pub(super) fn required<'a>(params: &'a Params, field: &str) -> Result<&'a Value, DispatchError> {
    match params.get(field) {
        None | Some(Value::Null) => Err(bad(field, "field required")),
        Some(value) => Ok(value),
    }
}

pub(super) fn required_str<'a>(params: &'a Params, field: &str) -> Result<&'a str, DispatchError> {
    required(params, field)?
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad(field, "must be a non-empty string"))
}

pub(super) fn optional_str<'a>(
    params: &'a Params,
    field: &str,
) -> Result<Option<&'a str>, DispatchError> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(bad(field, "must be a string")),
    }
}

/// An integer that fits `u16`, given as a JSON integer or an integer string
pub(super) fn u16_value(value: &Value, field: &str) -> Result<u16, DispatchError> {
    let n = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| bad(field, "must be an integer"))?;

    u16::try_from(n).map_err(|_| bad(field, "must be between 0 and 65535"))
}

pub(super) fn required_u16(params: &Params, field: &str) -> Result<u16, DispatchError> {
    u16_value(required(params, field)?, field)
}

pub(super) fn optional_u16(
    params: &Params,
    field: &str,
    default: u16,
) -> Result<u16, DispatchError> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => u16_value(value, field),
    }
}

/// A coil state: `true`/`false` or `1`/`0`
pub(super) fn required_coil(params: &Params, field: &str) -> Result<bool, DispatchError> {
    match required(params, field)? {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) if n.as_u64() == Some(1) => Ok(true),
        Value::Number(n) if n.as_u64() == Some(0) => Ok(false),
        _ => Err(bad(field, "must be a boolean")),
    }
}
