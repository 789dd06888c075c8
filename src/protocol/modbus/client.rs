//! One Modbus TCP connection

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::ModbusTarget;
use super::frame::{Frame, Request, Response, read_frame};
use crate::protocol::ProtocolError;

/// An open Modbus TCP session
///
/// Requests are strictly sequential: one request in flight per session.
#[derive(Debug)]
pub struct ModbusTcpSession {
    stream: TcpStream,
    endpoint: String,
    next_transaction: u16,
    op_timeout: Duration,
}

impl ModbusTcpSession {
    /// Connect to `target`
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Connect`] if the device is unreachable and
    /// [`ProtocolError::Timeout`] if the connect does not finish in time
    pub async fn connect(
        target: &ModbusTarget,
        connect_timeout: Duration,
        op_timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let endpoint = target.endpoint();
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| ProtocolError::Timeout {
                operation: "modbus connect",
                timeout: connect_timeout,
            })?
            .map_err(|e| ProtocolError::Connect {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        tracing::debug!(%endpoint, "modbus session opened");

        Ok(Self {
            stream,
            endpoint,
            next_transaction: 1,
            op_timeout,
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send `request` and wait for the matching response
    ///
    /// A timed-out session must be discarded: the late response would be
    /// read as the answer to the next request.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Exception`] for device exceptions, `Io` when
    /// the connection breaks, `Timeout` when no answer arrives in time
    pub async fn call(&mut self, unit_id: u8, request: Request) -> Result<Response, ProtocolError> {
        let op_timeout = self.op_timeout;
        tokio::time::timeout(op_timeout, self.exchange(unit_id, request))
            .await
            .map_err(|_| ProtocolError::Timeout {
                operation: "modbus request",
                timeout: op_timeout,
            })?
    }

    async fn exchange(&mut self, unit_id: u8, request: Request) -> Result<Response, ProtocolError> {
        let transaction_id = self.next_transaction;
        self.next_transaction = self.next_transaction.wrapping_add(1);

        let frame = Frame {
            transaction_id,
            unit_id,
            pdu: request.encode(),
        };
        self.stream.write_all(&frame.encode()).await?;

        let reply = read_frame(&mut self.stream).await?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "device closed the connection",
            )
        })?;

        if reply.transaction_id != transaction_id {
            return Err(ProtocolError::Malformed(format!(
                "transaction id {} does not match request {transaction_id}",
                reply.transaction_id
            )));
        }

        Response::decode(&request, &reply.pdu)
    }
}
