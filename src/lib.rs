//! Tractus Edge - idempotent command gateway for industrial devices
//!
//! Accepts device commands over HTTP, deduplicates them by idempotency key
//! in a durable ledger, and executes each accepted command at most once
//! against an OPC UA or Modbus TCP device.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     HTTP API                         │
//! │   /v1/commands  │  /v1/idempotency  │  /opcua  │ ... │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Orchestrator                        │
//! │   Validator  │  Idempotency Ledger  │  Events        │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │              Capability Dispatcher                   │
//! │   modbus.*  (TCP session pool)  │  opcua.*           │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod command;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod protocol;

pub use command::{CapabilityId, Command, RawCommand, RiskLevel, ValidationError};
pub use config::Config;
pub use db::{DbConn, DbPool, IdempotencyLedger, IdempotencyRepo};
pub use dispatch::{CapabilityHandler, CapabilityRegistry, CapabilityResult, DispatchError};
pub use error::{Error, Result};
pub use events::{CommandEvent, CounterSink, EventSink, TracingSink};
pub use orchestrator::{ExecuteError, Orchestrator, Outcome};
