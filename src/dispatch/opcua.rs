//! `opcua.*` capabilities

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::params::{optional_str, required, required_str};
use super::{CapabilityHandler, CapabilityRegistry, CapabilityResult, DispatchError};
use crate::protocol::OpcUaExecutor;

pub const READ: &str = "opcua.read@v1";
pub const WRITE: &str = "opcua.write@v1";

pub(super) fn register(
    registry: &mut CapabilityRegistry,
    executor: &Arc<dyn OpcUaExecutor>,
    default_endpoint: &str,
) {
    registry.register(
        READ,
        Arc::new(Read {
            executor: Arc::clone(executor),
            default_endpoint: default_endpoint.to_string(),
        }),
    );
    registry.register(
        WRITE,
        Arc::new(Write {
            executor: Arc::clone(executor),
            default_endpoint: default_endpoint.to_string(),
        }),
    );
}

/// `opcua.read@v1`
pub struct Read {
    pub executor: Arc<dyn OpcUaExecutor>,
    pub default_endpoint: String,
}

#[async_trait]
impl CapabilityHandler for Read {
    async fn execute(&self, params: &Map<String, Value>) -> Result<CapabilityResult, DispatchError> {
        let node_id = required_str(params, "nodeId")?;
        let endpoint = optional_str(params, "url")?.unwrap_or(&self.default_endpoint);

        let value = self.executor.read(endpoint, node_id).await?;
        tracing::info!(%endpoint, node_id, ?value, "opcua.read");

        Ok(CapabilityResult::new("opcua.read")
            .with("nodeId", node_id)
            .with("value", value))
    }
}

/// `opcua.write@v1`
///
/// The reported value is the one read back from the node after the write.
pub struct Write {
    pub executor: Arc<dyn OpcUaExecutor>,
    pub default_endpoint: String,
}

#[async_trait]
impl CapabilityHandler for Write {
    async fn execute(&self, params: &Map<String, Value>) -> Result<CapabilityResult, DispatchError> {
        let node_id = required_str(params, "nodeId")?;
        let value = required(params, "value")?;
        let endpoint = optional_str(params, "url")?.unwrap_or(&self.default_endpoint);
        let unit = optional_str(params, "unit")?;

        let confirmed = self.executor.write(endpoint, node_id, value).await?;
        tracing::info!(%endpoint, node_id, value = ?confirmed, "opcua.write");

        let mut result = CapabilityResult::new("opcua.write")
            .with("nodeId", node_id)
            .with("value", confirmed);
        if let Some(unit) = unit {
            result = result.with("unit", unit);
        }
        Ok(result)
    }
}
