//! Command envelope types
//!
//! A [`RawCommand`] is whatever JSON the client sent. The validator turns it
//! into a [`Command`], the only shape the orchestrator and dispatcher accept.

mod capability;
mod validator;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use capability::{CapabilityId, InvalidCapability};
pub use validator::{ValidationError, validate};

/// Inbound command envelope as received
///
/// Every field is kept as raw JSON so the validator can name the offending
/// field instead of failing the whole body on a type mismatch. Unknown fields
/// are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCommand {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub device_id: Option<Value>,
    #[serde(default)]
    pub capability: Option<Value>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub deadline: Option<Value>,
    #[serde(default)]
    pub idempotency_key: Option<Value>,
    #[serde(default)]
    pub risk_level: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Risk classification carried through for policy collaborators
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Parse the wire representation
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// A structurally valid device command
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: Uuid,
    pub device_id: String,
    pub capability: CapabilityId,
    /// Capability-specific; checked by the capability handler, not here
    pub params: Map<String, Value>,
    pub deadline: Option<DateTime<FixedOffset>>,
    pub idempotency_key: Option<String>,
    pub risk_level: RiskLevel,
    pub metadata: Map<String, Value>,
}
