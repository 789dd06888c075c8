//! Per-device Modbus session reuse

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::client::ModbusTcpSession;
use super::frame::{Request, Response};
use super::{ModbusExecutor, ModbusTarget};
use crate::protocol::ProtocolError;

/// Sessions unused for this long are closed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct Pooled {
    session: ModbusTcpSession,
    last_used: Instant,
}

type SessionSlot = Arc<Mutex<Option<Pooled>>>;
type SlotMap = HashMap<(String, u16), SessionSlot>;

/// Keeps one session per `(host, port)` and serializes requests on it
///
/// A session that fails with a transport error is dropped. When the failed
/// session was a reused one, the request is retried once on a fresh
/// connection; a freshly opened session is never retried.
///
/// Slots left without a session (failed connects) and sessions idle past the
/// idle timeout are removed the next time the pool is touched.
pub struct ModbusSessionPool {
    sessions: Mutex<SlotMap>,
    connect_timeout: Duration,
    op_timeout: Duration,
    idle_timeout: Duration,
}

impl ModbusSessionPool {
    #[must_use]
    pub fn new(connect_timeout: Duration, op_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            connect_timeout,
            op_timeout,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Number of devices with a live or in-use session
    pub async fn len(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        self.prune(&mut sessions);
        sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn slot(&self, target: &ModbusTarget) -> SessionSlot {
        let mut sessions = self.sessions.lock().await;
        self.prune(&mut sessions);
        sessions
            .entry((target.host.clone(), target.port))
            .or_default()
            .clone()
    }

    /// Drop slots nobody is using that hold no session or an idle one
    fn prune(&self, sessions: &mut SlotMap) {
        let idle_timeout = self.idle_timeout;
        sessions.retain(|(host, port), slot| {
            // Only the map holds it, so nobody can be waiting on the lock
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let keep = slot.try_lock().is_ok_and(|pooled| {
                pooled
                    .as_ref()
                    .is_some_and(|p| p.last_used.elapsed() < idle_timeout)
            });
            if !keep {
                tracing::debug!(%host, port, "modbus slot released");
            }
            keep
        });
    }

    async fn connect(&self, target: &ModbusTarget) -> Result<ModbusTcpSession, ProtocolError> {
        ModbusTcpSession::connect(target, self.connect_timeout, self.op_timeout).await
    }

    /// Run one request against `target`
    ///
    /// # Errors
    ///
    /// Returns the [`ProtocolError`] of the last attempt
    pub async fn call(
        &self,
        target: &ModbusTarget,
        request: Request,
    ) -> Result<Response, ProtocolError> {
        let slot = self.slot(target).await;
        let mut guard = slot.lock().await;

        let (mut session, reused) = match guard.take() {
            Some(pooled) => (pooled.session, true),
            None => (self.connect(target).await?, false),
        };

        match session.call(target.unit_id, request).await {
            Ok(response) => {
                *guard = Some(Pooled::new(session));
                Ok(response)
            }
            Err(e) if keeps_session(&e) => {
                *guard = Some(Pooled::new(session));
                Err(e)
            }
            Err(e) if reused && e.is_session_loss() => {
                tracing::warn!(
                    endpoint = %session.endpoint(),
                    error = %e,
                    "modbus session lost, reconnecting once"
                );
                drop(session);

                let mut fresh = self.connect(target).await?;
                let result = fresh.call(target.unit_id, request).await;
                if result.as_ref().map_or_else(keeps_session, |_| true) {
                    *guard = Some(Pooled::new(fresh));
                }
                result
            }
            Err(e) => {
                tracing::debug!(endpoint = %session.endpoint(), error = %e, "modbus session dropped");
                Err(e)
            }
        }
    }
}

impl Pooled {
    fn new(session: ModbusTcpSession) -> Self {
        Self {
            session,
            last_used: Instant::now(),
        }
    }
}

/// Device exceptions are answers; the link is still in sync
const fn keeps_session(e: &ProtocolError) -> bool {
    matches!(e, ProtocolError::Exception { .. })
}

fn unexpected(response: &Response) -> ProtocolError {
    ProtocolError::Malformed(format!("unexpected response {response:?}"))
}

#[async_trait]
impl ModbusExecutor for ModbusSessionPool {
    async fn read_coil(&self, target: &ModbusTarget, address: u16) -> Result<bool, ProtocolError> {
        let request = Request::ReadCoils {
            address,
            quantity: 1,
        };
        match self.call(target, request).await? {
            Response::Coils(bits) => bits.first().copied().ok_or_else(|| {
                ProtocolError::Malformed("empty coil response".to_string())
            }),
            other => Err(unexpected(&other)),
        }
    }

    async fn write_coil(
        &self,
        target: &ModbusTarget,
        address: u16,
        value: bool,
    ) -> Result<bool, ProtocolError> {
        match self
            .call(target, Request::WriteSingleCoil { address, value })
            .await?
        {
            Response::WriteSingleCoil { value, .. } => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    async fn read_holding_register(
        &self,
        target: &ModbusTarget,
        address: u16,
    ) -> Result<u16, ProtocolError> {
        let request = Request::ReadHoldingRegisters {
            address,
            quantity: 1,
        };
        match self.call(target, request).await? {
            Response::HoldingRegisters(words) => words.first().copied().ok_or_else(|| {
                ProtocolError::Malformed("empty register response".to_string())
            }),
            other => Err(unexpected(&other)),
        }
    }

    async fn write_holding_register(
        &self,
        target: &ModbusTarget,
        address: u16,
        value: u16,
    ) -> Result<u16, ProtocolError> {
        match self
            .call(target, Request::WriteSingleRegister { address, value })
            .await?
        {
            Response::WriteSingleRegister { value, .. } => Ok(value),
            other => Err(unexpected(&other)),
        }
    }
}
