//! Capability dispatch
//!
//! A [`CapabilityRegistry`] maps versioned capability ids to handlers. Each
//! handler checks its own params and performs exactly one device operation.

pub mod modbus;
pub mod opcua;
mod params;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::command::CapabilityId;
use crate::protocol::{ModbusExecutor, OpcUaExecutor, ProtocolError};

/// Default bound on a single dispatch
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Dispatch failure; every variant is a client error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown capability {0}")]
    UnknownCapability(String),

    #[error("invalid params: {0}")]
    BadParams(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl DispatchError {
    /// Stable machine-readable code for failure payloads
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownCapability(_) => "unknown_capability",
            Self::BadParams(_) => "bad_params",
            Self::ExecutionFailed(_) => "execution_failed",
        }
    }
}

impl From<ProtocolError> for DispatchError {
    fn from(e: ProtocolError) -> Self {
        if e.is_request_fault() {
            Self::BadParams(e.to_string())
        } else {
            Self::ExecutionFailed(e.to_string())
        }
    }
}

/// Outcome of one capability invocation
///
/// Serializes as `{"kind": ..., <fields>}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityResult {
    /// Unversioned capability, e.g. `modbus.write_hr`
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CapabilityResult {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// Executes one capability
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Check `params` and perform the device operation
    async fn execute(&self, params: &Map<String, Value>) -> Result<CapabilityResult, DispatchError>;
}

/// Capability id to handler table
pub struct CapabilityRegistry {
    handlers: HashMap<String, Arc<dyn CapabilityHandler>>,
    timeout: Duration,
}

impl CapabilityRegistry {
    /// Empty registry
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            timeout,
        }
    }

    /// Registry with every built-in capability
    #[must_use]
    pub fn with_builtins(
        modbus: Arc<dyn ModbusExecutor>,
        opcua: Arc<dyn OpcUaExecutor>,
        opcua_endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let opcua_endpoint = opcua_endpoint.into();
        let mut registry = Self::new(timeout);
        modbus::register(&mut registry, &modbus);
        opcua::register(&mut registry, &opcua, &opcua_endpoint);
        registry
    }

    /// Add or replace the handler for `capability` (full versioned id)
    pub fn register(&mut self, capability: &str, handler: Arc<dyn CapabilityHandler>) {
        self.handlers.insert(capability.to_string(), handler);
    }

    /// Whether `capability` has a handler
    #[must_use]
    pub fn contains(&self, capability: &str) -> bool {
        self.handlers.contains_key(capability)
    }

    /// Registered capability ids, sorted
    #[must_use]
    pub fn capabilities(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Route to the handler for `capability`, bounded by the dispatch timeout
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownCapability`] when no handler is
    /// registered, otherwise whatever the handler returns. A timeout is an
    /// [`DispatchError::ExecutionFailed`].
    pub async fn dispatch(
        &self,
        capability: &CapabilityId,
        params: &Map<String, Value>,
    ) -> Result<CapabilityResult, DispatchError> {
        let handler = self
            .handlers
            .get(capability.as_str())
            .ok_or_else(|| DispatchError::UnknownCapability(capability.to_string()))?;

        match tokio::time::timeout(self.timeout, handler.execute(params)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(%capability, timeout = ?self.timeout, "dispatch timed out");
                Err(DispatchError::ExecutionFailed(format!(
                    "timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}
