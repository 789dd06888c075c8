//! `modbus.*` capabilities

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::params::{optional_str, optional_u16, required_coil, required_u16};
use super::{CapabilityHandler, CapabilityRegistry, CapabilityResult, DispatchError};
use crate::protocol::ModbusExecutor;
use crate::protocol::modbus::{DEFAULT_HOST, DEFAULT_PORT, ModbusTarget};

/// Engineering unit reported for register writes when none is given
const DEFAULT_REGISTER_UNIT: &str = "raw";

pub const READ_COIL: &str = "modbus.read_coil@v1";
pub const WRITE_COIL: &str = "modbus.write_coil@v1";
pub const READ_HOLDING_REGISTER: &str = "modbus.read_hr@v1";
pub const WRITE_HOLDING_REGISTER: &str = "modbus.write_hr@v1";

pub(super) fn register(registry: &mut CapabilityRegistry, executor: &Arc<dyn ModbusExecutor>) {
    registry.register(READ_COIL, Arc::new(ReadCoil(Arc::clone(executor))));
    registry.register(WRITE_COIL, Arc::new(WriteCoil(Arc::clone(executor))));
    registry.register(
        READ_HOLDING_REGISTER,
        Arc::new(ReadHoldingRegister(Arc::clone(executor))),
    );
    registry.register(
        WRITE_HOLDING_REGISTER,
        Arc::new(WriteHoldingRegister(Arc::clone(executor))),
    );
}

fn target(params: &Map<String, Value>) -> Result<ModbusTarget, DispatchError> {
    let host = optional_str(params, "host")?.unwrap_or(DEFAULT_HOST);
    let port = optional_u16(params, "port", DEFAULT_PORT)?;
    let unit_id = optional_u16(params, "unitId", 0)?;
    let unit_id = u8::try_from(unit_id)
        .map_err(|_| DispatchError::BadParams("unitId: must be between 0 and 255".into()))?;
    Ok(ModbusTarget::new(host, port).with_unit_id(unit_id))
}

/// `modbus.read_coil@v1`
pub struct ReadCoil(pub Arc<dyn ModbusExecutor>);

#[async_trait]
impl CapabilityHandler for ReadCoil {
    async fn execute(&self, params: &Map<String, Value>) -> Result<CapabilityResult, DispatchError> {
        let target = target(params)?;
        let address = required_u16(params, "address")?;

        let value = self.0.read_coil(&target, address).await?;
        tracing::info!(endpoint = %target.endpoint(), address, value, "modbus.read_coil");

        Ok(CapabilityResult::new("modbus.read_coil")
            .with("address", address)
            .with("value", value))
    }
}

/// `modbus.write_coil@v1`
pub struct WriteCoil(pub Arc<dyn ModbusExecutor>);

#[async_trait]
impl CapabilityHandler for WriteCoil {
    async fn execute(&self, params: &Map<String, Value>) -> Result<CapabilityResult, DispatchError> {
        let target = target(params)?;
        let address = required_u16(params, "address")?;
        let value = required_coil(params, "value")?;

        let echoed = self.0.write_coil(&target, address, value).await?;
        tracing::info!(endpoint = %target.endpoint(), address, value = echoed, "modbus.write_coil");

        Ok(CapabilityResult::new("modbus.write_coil")
            .with("address", address)
            .with("value", echoed)
            .with("ack", true))
    }
}

/// `modbus.read_hr@v1`
pub struct ReadHoldingRegister(pub Arc<dyn ModbusExecutor>);

#[async_trait]
impl CapabilityHandler for ReadHoldingRegister {
    async fn execute(&self, params: &Map<String, Value>) -> Result<CapabilityResult, DispatchError> {
        let target = target(params)?;
        let address = required_u16(params, "address")?;

        let value = self.0.read_holding_register(&target, address).await?;
        tracing::info!(endpoint = %target.endpoint(), address, value, "modbus.read_hr");

        Ok(CapabilityResult::new("modbus.read_hr")
            .with("address", address)
            .with("value", value))
    }
}

/// `modbus.write_hr@v1`
pub struct WriteHoldingRegister(pub Arc<dyn ModbusExecutor>);

#[async_trait]
impl CapabilityHandler for WriteHoldingRegister {
    async fn execute(&self, params: &Map<String, Value>) -> Result<CapabilityResult, DispatchError> {
        let target = target(params)?;
        let address = required_u16(params, "address")?;
        let value = required_u16(params, "value")?;
        let unit = optional_str(params, "unit")?.unwrap_or(DEFAULT_REGISTER_UNIT);

        let echoed = self
            .0
            .write_holding_register(&target, address, value)
            .await?;
        tracing::info!(endpoint = %target.endpoint(), address, value = echoed, "modbus.write_hr");

        Ok(CapabilityResult::new("modbus.write_hr")
            .with("address", address)
            .with("value", echoed)
            .with("unit", unit)
            .with("ack", true))
    }
}
