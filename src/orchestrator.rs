//! Command execution with at-most-once semantics per idempotency key
//!
//! ```text
//!            no key ─────────────────────────────► dispatch ─► respond
//!   validate ─┤
//!            key ─► reserve ─┬─ won ──► dispatch ─► complete ─► respond
//!                            └─ lost ─► lookup ─┬─ completed ─► replay
//!                                               ├─ failed ────► replay (client error)
//!                                               └─ accepted ──► in flight (conflict)
//! ```
//!
//! Only the caller whose reservation wins ever dispatches for a key. Ledger
//! calls run on the blocking pool; device calls run on the reactor. The keyed
//! path runs on a spawned task, so a caller that stops polling (a dropped HTTP
//! request) cannot strand a reserved record in `accepted`.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::Error;
use crate::command::{self, Command, RawCommand, ValidationError};
use crate::db::{IdempotencyLedger, LedgerStatus, TerminalStatus};
use crate::dispatch::CapabilityRegistry;
use crate::events::{CommandEvent, EventSink};

/// Result of executing a command
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Capability succeeded; payload is `{ok: true, commandId, result}`
    Completed { payload: Value, replayed: bool },
    /// Capability failed; payload is `{ok: false, commandId, error}`
    Failed { payload: Value, replayed: bool },
    /// The key is reserved but has no terminal outcome yet
    InFlight { key: String },
}

impl Outcome {
    /// Response body, if the outcome carries one
    #[must_use]
    pub const fn payload(&self) -> Option<&Value> {
        match self {
            Self::Completed { payload, .. } | Self::Failed { payload, .. } => Some(payload),
            Self::InFlight { .. } => None,
        }
    }

    /// Whether the payload came from the ledger rather than a dispatch
    #[must_use]
    pub const fn is_replay(&self) -> bool {
        matches!(
            self,
            Self::Completed { replayed: true, .. } | Self::Failed { replayed: true, .. }
        )
    }
}

/// Execution failure that is not a command outcome
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("idempotency ledger unavailable: {0}")]
    Storage(#[source] Error),
}

/// Validates, deduplicates, and dispatches commands
#[derive(Clone)]
pub struct Orchestrator {
    ledger: Arc<dyn IdempotencyLedger>,
    registry: Arc<CapabilityRegistry>,
    events: Arc<dyn EventSink>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        ledger: Arc<dyn IdempotencyLedger>,
        registry: Arc<CapabilityRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            ledger,
            registry,
            events,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Validate without touching the ledger or any device
    ///
    /// # Errors
    ///
    /// Returns the field-level [`ValidationError`]
    pub fn validate(&self, raw: RawCommand) -> Result<Command, ValidationError> {
        command::validate(raw)
    }

    /// Validate and execute `raw`
    ///
    /// A failed dispatch is an [`Outcome::Failed`], not an error.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError::Validation`] before any side effect, or
    /// [`ExecuteError::Storage`] when the ledger cannot be read or written
    pub async fn execute(&self, raw: RawCommand) -> Result<Outcome, ExecuteError> {
        let cmd = command::validate(raw)?;

        let Some(key) = cmd.idempotency_key.clone() else {
            let (payload, status) = self.run(&cmd).await;
            return Ok(fresh(payload, status));
        };

        // Reserve and complete must both run even if this caller is dropped
        let this = self.clone();
        tokio::spawn(async move { this.execute_keyed(key, cmd).await })
            .await
            .map_err(|e| ExecuteError::Storage(Error::Database(format!("command task failed: {e}"))))?
    }

    async fn execute_keyed(&self, key: String, cmd: Command) -> Result<Outcome, ExecuteError> {
        let reserved = {
            let (key, device_id, capability) = (
                key.clone(),
                cmd.device_id.clone(),
                cmd.capability.to_string(),
            );
            self.with_ledger(move |ledger| ledger.reserve(&key, &device_id, &capability))
                .await
                .map_err(ExecuteError::Storage)?
        };

        if reserved {
            tracing::debug!(idempotency_key = %key, command_id = %cmd.id, "key reserved");
            return self.finish(key, cmd).await;
        }

        let lookup_key = key.clone();
        let entry = self
            .with_ledger(move |ledger| ledger.lookup(&lookup_key))
            .await
            .map_err(ExecuteError::Storage)?;

        let outcome = match entry {
            Some(entry) => match (entry.status, entry.result_payload) {
                (LedgerStatus::Completed, Some(payload)) => Outcome::Completed {
                    payload,
                    replayed: true,
                },
                (LedgerStatus::Failed, Some(payload)) => Outcome::Failed {
                    payload,
                    replayed: true,
                },
                _ => Outcome::InFlight { key: key.clone() },
            },
            // Reservation lost but the record is gone: treat as unresolved
            None => Outcome::InFlight { key: key.clone() },
        };

        let event = if outcome.is_replay() {
            CommandEvent::Replayed { key }
        } else {
            CommandEvent::Conflict { key }
        };
        self.events.emit(&event);

        Ok(outcome)
    }

    /// Dispatch a reserved command and record its terminal status
    async fn finish(&self, key: String, cmd: Command) -> Result<Outcome, ExecuteError> {
        let (payload, status) = self.run(&cmd).await;

        let stored = payload.clone();
        let completed_key = key.clone();
        if let Err(e) = self
            .with_ledger(move |ledger| ledger.complete(&completed_key, &stored, status))
            .await
        {
            tracing::error!(
                idempotency_key = %key,
                command_id = %cmd.id,
                error = %e,
                "dispatch finished but outcome was not recorded"
            );
            return Err(ExecuteError::Storage(e));
        }

        Ok(fresh(payload, status))
    }

    /// Dispatch and build the response payload
    async fn run(&self, cmd: &Command) -> (Value, TerminalStatus) {
        let kind = cmd.capability.kind().to_string();

        match self.registry.dispatch(&cmd.capability, &cmd.params).await {
            Ok(result) => {
                self.events.emit(&CommandEvent::Dispatched { kind });
                let payload = json!({
                    "ok": true,
                    "commandId": cmd.id,
                    "result": result,
                });
                (payload, TerminalStatus::Completed)
            }
            Err(e) => {
                tracing::debug!(command_id = %cmd.id, capability = %cmd.capability, error = %e, "dispatch failed");
                self.events.emit(&CommandEvent::Failed { kind });
                let payload = json!({
                    "ok": false,
                    "commandId": cmd.id,
                    "error": {
                        "code": e.code(),
                        "message": e.to_string(),
                    },
                });
                (payload, TerminalStatus::Failed)
            }
        }
    }

    /// Run a ledger operation on the blocking pool
    async fn with_ledger<T, F>(&self, op: F) -> crate::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn IdempotencyLedger) -> crate::Result<T> + Send + 'static,
    {
        let ledger = Arc::clone(&self.ledger);
        tokio::task::spawn_blocking(move || op(ledger.as_ref()))
            .await
            .map_err(|e| Error::Database(format!("ledger task failed: {e}")))?
    }
}

fn fresh(payload: Value, status: TerminalStatus) -> Outcome {
    match status {
        TerminalStatus::Completed => Outcome::Completed {
            payload,
            replayed: false,
        },
        TerminalStatus::Failed => Outcome::Failed {
            payload,
            replayed: false,
        },
    }
}
