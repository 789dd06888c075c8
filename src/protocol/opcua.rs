//! OPC UA node access
//!
//! The gateway reaches OPC UA servers through [`OpcUaExecutor`]. No wire
//! client ships with the crate: by default [`OfflineOpcUa`] fails every call
//! with a connect error. The opt-in [`SimulatedOpcUa`] keeps an in-memory
//! address space with the typed variables a demo server exposes.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::ProtocolError;

/// Default endpoint when a command names none
pub const DEFAULT_ENDPOINT: &str = "opc.tcp://localhost:4840/freeopcua/server/";

/// Node seeded into the demo address space
pub const DEMO_SPEED_NODE: &str = "ns=2;s=Demo/SpeedRpm";

/// Built-in scalar data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VariantType {
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    Float,
    Double,
    String,
}

impl fmt::Display for VariantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A typed scalar node value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Variant {
    Boolean(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    Float(f32),
    Double(f64),
    String(String),
}

impl Variant {
    #[must_use]
    pub const fn variant_type(&self) -> VariantType {
        match self {
            Self::Boolean(_) => VariantType::Boolean,
            Self::Int16(_) => VariantType::Int16,
            Self::UInt16(_) => VariantType::UInt16,
            Self::Int32(_) => VariantType::Int32,
            Self::UInt32(_) => VariantType::UInt32,
            Self::Int64(_) => VariantType::Int64,
            Self::Float(_) => VariantType::Float,
            Self::Double(_) => VariantType::Double,
            Self::String(_) => VariantType::String,
        }
    }

    /// Coerce a JSON value to `ty`
    ///
    /// Integer types accept integral numbers in range (`1500.0` is `1500`);
    /// float types accept any number that stays finite at their width.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TypeMismatch`] when `value` has no lossless
    /// representation as `ty`
    #[allow(clippy::cast_possible_truncation)]
    pub fn coerce(value: &Value, ty: VariantType) -> Result<Self, ProtocolError> {
        let mismatch = || ProtocolError::TypeMismatch {
            value: value.to_string(),
            expected: ty,
        };

        let coerced = match ty {
            VariantType::Boolean => value.as_bool().map(Self::Boolean),
            VariantType::String => value.as_str().map(|s| Self::String(s.to_string())),
            VariantType::Float => value
                .as_f64()
                .map(|f| f as f32)
                .filter(|f| f.is_finite())
                .map(Self::Float),
            VariantType::Double => value.as_f64().map(Self::Double),
            VariantType::Int16 => integral(value).and_then(|i| i16::try_from(i).ok()).map(Self::Int16),
            VariantType::UInt16 => integral(value).and_then(|i| u16::try_from(i).ok()).map(Self::UInt16),
            VariantType::Int32 => integral(value).and_then(|i| i32::try_from(i).ok()).map(Self::Int32),
            VariantType::UInt32 => integral(value).and_then(|i| u32::try_from(i).ok()).map(Self::UInt32),
            VariantType::Int64 => integral(value).map(Self::Int64),
        };

        coerced.ok_or_else(mismatch)
    }
}

impl From<Variant> for Value {
    fn from(variant: Variant) -> Self {
        match variant {
            Variant::Boolean(b) => Self::Bool(b),
            Variant::Int16(i) => i.into(),
            Variant::UInt16(i) => i.into(),
            Variant::Int32(i) => i.into(),
            Variant::UInt32(i) => i.into(),
            Variant::Int64(i) => i.into(),
            Variant::Float(f) => f.into(),
            Variant::Double(f) => f.into(),
            Variant::String(s) => Self::String(s),
        }
    }
}

/// Integer value of a JSON number with no fractional part
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn integral(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    let f = value.as_f64()?;
    // i64::MAX is not representable as f64; stay strictly inside the range
    (f.fract() == 0.0 && (-9.2e18..=9.2e18).contains(&f)).then_some(f as i64)
}

/// Read and write OPC UA variables by node id
#[async_trait]
pub trait OpcUaExecutor: Send + Sync {
    /// Read the current value of `node_id`
    async fn read(&self, endpoint: &str, node_id: &str) -> Result<Variant, ProtocolError>;

    /// Write `value`, coerced to the node's data type, and return the value
    /// read back afterwards
    async fn write(
        &self,
        endpoint: &str,
        node_id: &str,
        value: &Value,
    ) -> Result<Variant, ProtocolError>;
}

/// Executor for deployments with no OPC UA client
///
/// Every operation fails with [`ProtocolError::Connect`] before anything is
/// sent, so an opcua command is recorded as an execution failure rather than
/// reported as applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineOpcUa;

impl OfflineOpcUa {
    fn unavailable(endpoint: &str) -> ProtocolError {
        ProtocolError::Connect {
            endpoint: endpoint.to_string(),
            reason: "no OPC UA client configured".to_string(),
        }
    }
}

#[async_trait]
impl OpcUaExecutor for OfflineOpcUa {
    async fn read(&self, endpoint: &str, _node_id: &str) -> Result<Variant, ProtocolError> {
        Err(Self::unavailable(endpoint))
    }

    async fn write(
        &self,
        endpoint: &str,
        _node_id: &str,
        _value: &Value,
    ) -> Result<Variant, ProtocolError> {
        Err(Self::unavailable(endpoint))
    }
}

#[derive(Debug, Clone)]
struct Node {
    value: Variant,
    writable: bool,
}

/// In-memory OPC UA server stand-in
#[derive(Debug)]
pub struct SimulatedOpcUa {
    endpoint: String,
    nodes: Mutex<HashMap<String, Node>>,
}

impl SimulatedOpcUa {
    /// Empty address space served at `endpoint`
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Demo address space with [`DEMO_SPEED_NODE`] as a writable `Int32` of 100
    #[must_use]
    pub fn demo(endpoint: impl Into<String>) -> Self {
        let nodes = HashMap::from([(
            DEMO_SPEED_NODE.to_string(),
            Node {
                value: Variant::Int32(100),
                writable: true,
            },
        )]);
        Self {
            endpoint: endpoint.into(),
            nodes: Mutex::new(nodes),
        }
    }

    /// Add or replace a variable
    pub async fn insert(&self, node_id: impl Into<String>, value: Variant, writable: bool) {
        self.nodes
            .lock()
            .await
            .insert(node_id.into(), Node { value, writable });
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn check_endpoint(&self, endpoint: &str) -> Result<(), ProtocolError> {
        if endpoint.trim_end_matches('/') == self.endpoint.trim_end_matches('/') {
            Ok(())
        } else {
            Err(ProtocolError::Connect {
                endpoint: endpoint.to_string(),
                reason: "no OPC UA server at this endpoint".to_string(),
            })
        }
    }
}

#[async_trait]
impl OpcUaExecutor for SimulatedOpcUa {
    async fn read(&self, endpoint: &str, node_id: &str) -> Result<Variant, ProtocolError> {
        self.check_endpoint(endpoint)?;
        self.nodes
            .lock()
            .await
            .get(node_id)
            .map(|node| node.value.clone())
            .ok_or_else(|| ProtocolError::UnknownNode(node_id.to_string()))
    }

    async fn write(
        &self,
        endpoint: &str,
        node_id: &str,
        value: &Value,
    ) -> Result<Variant, ProtocolError> {
        self.check_endpoint(endpoint)?;
        let mut nodes = self.nodes.lock().await;
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| ProtocolError::UnknownNode(node_id.to_string()))?;
        if !node.writable {
            return Err(ProtocolError::NotWritable(node_id.to_string()));
        }

        node.value = Variant::coerce(value, node.value.variant_type())?;
        tracing::debug!(node_id, value = ?node.value, "opcua node written");
        Ok(node.value.clone())
    }
}
