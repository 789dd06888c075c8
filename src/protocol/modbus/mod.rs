//! Modbus TCP client, session pool, and simulator

pub mod client;
pub mod frame;
pub mod pool;
pub mod sim;

use async_trait::async_trait;

pub use client::ModbusTcpSession;
pub use frame::{ExceptionCode, Request, Response};
pub use pool::ModbusSessionPool;
pub use sim::{DataStore, ModbusSimulator};

use super::ProtocolError;

/// Default Modbus host when a command names none
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default Modbus port when a command names none
pub const DEFAULT_PORT: u16 = 5020;

/// Address of a Modbus device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModbusTarget {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl ModbusTarget {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id: 0,
        }
    }

    #[must_use]
    pub const fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    /// `host:port` for connecting and logging
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ModbusTarget {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

/// Single-point Modbus operations used by capability handlers
///
/// Addresses are zero-based protocol addresses.
#[async_trait]
pub trait ModbusExecutor: Send + Sync {
    /// Read one coil
    async fn read_coil(&self, target: &ModbusTarget, address: u16) -> Result<bool, ProtocolError>;

    /// Write one coil, returning the value the device echoed
    async fn write_coil(
        &self,
        target: &ModbusTarget,
        address: u16,
        value: bool,
    ) -> Result<bool, ProtocolError>;

    /// Read one holding register
    async fn read_holding_register(
        &self,
        target: &ModbusTarget,
        address: u16,
    ) -> Result<u16, ProtocolError>;

    /// Write one holding register, returning the value the device echoed
    async fn write_holding_register(
        &self,
        target: &ModbusTarget,
        address: u16,
        value: u16,
    ) -> Result<u16, ProtocolError>;
}
