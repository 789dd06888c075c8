//! In-process Modbus TCP device simulator
//!
//! Serves 100 coils, discrete inputs, holding registers and input registers,
//! all zero-initialised and zero-based. The unit id is ignored.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::frame::{ExceptionCode, Frame, Request, Response, exception_pdu, read_frame};

/// Points per table in the default simulator
pub const DEFAULT_POINTS: usize = 100;

/// Simulated point tables
#[derive(Debug, Clone)]
pub struct DataStore {
    pub coils: Vec<bool>,
    pub discrete_inputs: Vec<bool>,
    pub holding_registers: Vec<u16>,
    pub input_registers: Vec<u16>,
}

impl DataStore {
    #[must_use]
    pub fn new(points: usize) -> Self {
        Self {
            coils: vec![false; points],
            discrete_inputs: vec![false; points],
            holding_registers: vec![0; points],
            input_registers: vec![0; points],
        }
    }

    /// Apply one request
    ///
    /// # Errors
    ///
    /// Returns [`ExceptionCode::IllegalDataAddress`] when the request reaches
    /// past the end of a table
    pub fn apply(&mut self, request: Request) -> Result<Response, ExceptionCode> {
        match request {
            Request::ReadCoils { address, quantity } => {
                Ok(Response::Coils(range(&self.coils, address, quantity)?.to_vec()))
            }
            Request::ReadDiscreteInputs { address, quantity } => Ok(Response::DiscreteInputs(
                range(&self.discrete_inputs, address, quantity)?.to_vec(),
            )),
            Request::ReadHoldingRegisters { address, quantity } => Ok(Response::HoldingRegisters(
                range(&self.holding_registers, address, quantity)?.to_vec(),
            )),
            Request::ReadInputRegisters { address, quantity } => Ok(Response::InputRegisters(
                range(&self.input_registers, address, quantity)?.to_vec(),
            )),
            Request::WriteSingleCoil { address, value } => {
                *point(&mut self.coils, address)? = value;
                Ok(Response::WriteSingleCoil { address, value })
            }
            Request::WriteSingleRegister { address, value } => {
                *point(&mut self.holding_registers, address)? = value;
                Ok(Response::WriteSingleRegister { address, value })
            }
        }
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new(DEFAULT_POINTS)
    }
}

fn range<T>(table: &[T], address: u16, quantity: u16) -> Result<&[T], ExceptionCode> {
    let start = usize::from(address);
    table
        .get(start..start + usize::from(quantity))
        .ok_or(ExceptionCode::IllegalDataAddress)
}

fn point<T>(table: &mut [T], address: u16) -> Result<&mut T, ExceptionCode> {
    table
        .get_mut(usize::from(address))
        .ok_or(ExceptionCode::IllegalDataAddress)
}

/// Modbus TCP server over a shared [`DataStore`]
#[derive(Debug, Clone, Default)]
pub struct ModbusSimulator {
    store: Arc<Mutex<DataStore>>,
}

impl ModbusSimulator {
    #[must_use]
    pub fn new(store: DataStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// Shared handle to the point tables
    #[must_use]
    pub fn store(&self) -> Arc<Mutex<DataStore>> {
        Arc::clone(&self.store)
    }

    /// Bind `addr` and serve in a background task
    ///
    /// Binding port 0 picks an ephemeral port; the bound address is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound
    pub async fn spawn(
        &self,
        addr: impl tokio::net::ToSocketAddrs,
    ) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let sim = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = sim.serve(listener).await {
                tracing::error!(error = %e, "modbus simulator stopped");
            }
        });
        Ok((local, handle))
    }

    /// Accept connections until the listener fails
    ///
    /// # Errors
    ///
    /// Returns the accept error that stopped the loop
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "modbus simulator listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let store = self.store();
            tokio::spawn(async move {
                tracing::debug!(%peer, "modbus client connected");
                if let Err(e) = serve_connection(stream, store).await {
                    tracing::debug!(%peer, error = %e, "modbus client connection ended");
                }
            });
        }
    }
}

/// Serve one client connection until it closes
///
/// # Errors
///
/// Returns the I/O error that ended the connection
pub async fn serve_connection(
    mut stream: TcpStream,
    store: Arc<Mutex<DataStore>>,
) -> std::io::Result<()> {
    while let Some(frame) = read_frame(&mut stream).await? {
        let function = frame.pdu.first().copied().unwrap_or_default();
        let pdu = match Request::decode(&frame.pdu) {
            Ok(request) => match store.lock().await.apply(request) {
                Ok(response) => response.encode(),
                Err(code) => exception_pdu(function, code),
            },
            Err(code) => exception_pdu(function, code),
        };

        let reply = Frame {
            transaction_id: frame.transaction_id,
            unit_id: frame.unit_id,
            pdu,
        };
        stream.write_all(&reply.encode()).await?;
    }
    Ok(())
}
