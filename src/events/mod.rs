//! Command lifecycle events
//!
//! The orchestrator reports what happened to each command through an
//! [`EventSink`]. Emitting is best-effort: sinks never fail the caller.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

/// Something that happened to a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    /// A capability ran and succeeded
    Dispatched { kind: String },
    /// A capability was attempted and failed
    Failed { kind: String },
    /// A duplicate key was answered from the ledger
    Replayed { key: String },
    /// A duplicate key arrived while the first attempt was unresolved
    Conflict { key: String },
}

impl CommandEvent {
    /// Event name, e.g. `command_dispatched`
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Dispatched { .. } => "command_dispatched",
            Self::Failed { .. } => "command_failed",
            Self::Replayed { .. } => "command_replayed",
            Self::Conflict { .. } => "command_conflict",
        }
    }
}

/// Receives command events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &CommandEvent);
}

/// Logs every event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &CommandEvent) {
        match event {
            CommandEvent::Dispatched { kind } => {
                tracing::info!(event = event.name(), %kind, "command dispatched");
            }
            CommandEvent::Failed { kind } => {
                tracing::warn!(event = event.name(), %kind, "command failed");
            }
            CommandEvent::Replayed { key } => {
                tracing::info!(event = event.name(), idempotency_key = %key, "command replayed");
            }
            CommandEvent::Conflict { key } => {
                tracing::warn!(event = event.name(), idempotency_key = %key, "command in flight");
            }
        }
    }
}

/// Counter snapshot served on `/api/stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventCounts {
    /// Successful dispatches per capability kind
    pub dispatched: BTreeMap<String, u64>,
    /// Failed dispatches per capability kind
    pub failed: BTreeMap<String, u64>,
    pub replayed: u64,
    pub conflicts: u64,
}

/// Counts events per kind and forwards them to [`TracingSink`]
#[derive(Debug, Default, Clone)]
pub struct CounterSink {
    counts: Arc<Mutex<EventCounts>>,
}

impl CounterSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counts
    #[must_use]
    pub fn snapshot(&self) -> EventCounts {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for CounterSink {
    fn emit(&self, event: &CommandEvent) {
        TracingSink.emit(event);

        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        match event {
            CommandEvent::Dispatched { kind } => {
                *counts.dispatched.entry(kind.clone()).or_default() += 1;
            }
            CommandEvent::Failed { kind } => {
                *counts.failed.entry(kind.clone()).or_default() += 1;
            }
            CommandEvent::Replayed { .. } => counts.replayed += 1,
            CommandEvent::Conflict { .. } => counts.conflicts += 1,
        }
    }
}
