//! Device protocol executors
//!
//! Capability handlers talk to devices only through the [`ModbusExecutor`]
//! and [`OpcUaExecutor`] traits, so tests can swap in fakes and the real
//! clients stay free of command semantics.

pub mod modbus;
pub mod opcua;

use std::time::Duration;

pub use modbus::{ModbusExecutor, ModbusSessionPool, ModbusTarget};
pub use opcua::{OfflineOpcUa, OpcUaExecutor, SimulatedOpcUa, Variant, VariantType};

use modbus::ExceptionCode;

/// Failure talking to a device
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("cannot connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device rejected function {function:#04x}: {code}")]
    Exception { function: u8, code: ExceptionCode },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("node {0} is not writable")]
    NotWritable(String),

    #[error("cannot write {value} to a {expected} node")]
    TypeMismatch {
        value: String,
        expected: VariantType,
    },
}

impl ProtocolError {
    /// Whether the request was wrong rather than the device or link failing
    #[must_use]
    pub const fn is_request_fault(&self) -> bool {
        match self {
            Self::Exception { code, .. } => code.is_request_fault(),
            Self::UnknownNode(_) | Self::NotWritable(_) | Self::TypeMismatch { .. } => true,
            _ => false,
        }
    }

    /// Whether a pooled session that produced this error is dead
    #[must_use]
    pub const fn is_session_loss(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
