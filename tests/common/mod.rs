//! Shared test utilities

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tractus_edge::db::{self, IdempotencyLedger, IdempotencyRepo, LedgerEntry, TerminalStatus};
use tractus_edge::dispatch::{CapabilityRegistry, DEFAULT_DISPATCH_TIMEOUT};
use tractus_edge::events::CounterSink;
use tractus_edge::protocol::modbus::ExceptionCode;
use tractus_edge::protocol::opcua::DEFAULT_ENDPOINT;
use tractus_edge::protocol::{ModbusExecutor, ModbusTarget, OpcUaExecutor, ProtocolError, SimulatedOpcUa};
use tractus_edge::{DbPool, Error, Orchestrator};

/// First register address the fake device rejects
pub const MISSING_REGISTER: u16 = 500;

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// In-memory Modbus device that counts every operation
///
/// Registers at [`MISSING_REGISTER`] and above answer with an illegal data
/// address exception.
#[derive(Default)]
pub struct FakeModbus {
    calls: AtomicUsize,
    coils: Mutex<HashMap<u16, bool>>,
    registers: Mutex<HashMap<u16, u16>>,
    delay: Duration,
}

impl FakeModbus {
    /// Device that takes `delay` to answer each request
    #[must_use]
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Operations performed so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn coil(&self, address: u16) -> Option<bool> {
        self.coils.lock().unwrap().get(&address).copied()
    }

    #[must_use]
    pub fn register(&self, address: u16) -> Option<u16> {
        self.registers.lock().unwrap().get(&address).copied()
    }

    async fn begin(&self, function: u8, address: u16) -> Result<(), ProtocolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if address >= MISSING_REGISTER {
            return Err(ProtocolError::Exception {
                function,
                code: ExceptionCode::IllegalDataAddress,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ModbusExecutor for FakeModbus {
    async fn read_coil(&self, _: &ModbusTarget, address: u16) -> Result<bool, ProtocolError> {
        self.begin(0x01, address).await?;
        Ok(self.coil(address).unwrap_or_default())
    }

    async fn write_coil(
        &self,
        _: &ModbusTarget,
        address: u16,
        value: bool,
    ) -> Result<bool, ProtocolError> {
        self.begin(0x05, address).await?;
        self.coils.lock().unwrap().insert(address, value);
        Ok(value)
    }

    async fn read_holding_register(
        &self,
        _: &ModbusTarget,
        address: u16,
    ) -> Result<u16, ProtocolError> {
        self.begin(0x03, address).await?;
        Ok(self.register(address).unwrap_or_default())
    }

    async fn write_holding_register(
        &self,
        _: &ModbusTarget,
        address: u16,
        value: u16,
    ) -> Result<u16, ProtocolError> {
        self.begin(0x06, address).await?;
        self.registers.lock().unwrap().insert(address, value);
        Ok(value)
    }
}

/// OPC UA executor that counts writes before handing them to the simulator
pub struct CountingOpcUa {
    inner: SimulatedOpcUa,
    writes: AtomicUsize,
}

impl CountingOpcUa {
    #[must_use]
    pub fn demo() -> Self {
        Self {
            inner: SimulatedOpcUa::demo(DEFAULT_ENDPOINT),
            writes: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OpcUaExecutor for CountingOpcUa {
    async fn read(
        &self,
        endpoint: &str,
        node_id: &str,
    ) -> Result<tractus_edge::protocol::Variant, ProtocolError> {
        self.inner.read(endpoint, node_id).await
    }

    async fn write(
        &self,
        endpoint: &str,
        node_id: &str,
        value: &serde_json::Value,
    ) -> Result<tractus_edge::protocol::Variant, ProtocolError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(endpoint, node_id, value).await
    }
}

/// Ledger that reserves and looks up normally but cannot record outcomes
pub struct UnrecordableLedger(pub IdempotencyRepo);

impl IdempotencyLedger for UnrecordableLedger {
    fn reserve(&self, key: &str, device_id: &str, capability: &str) -> tractus_edge::Result<bool> {
        self.0.reserve(key, device_id, capability)
    }

    fn complete(
        &self,
        _: &str,
        _: &serde_json::Value,
        _: TerminalStatus,
    ) -> tractus_edge::Result<()> {
        Err(Error::Database("disk I/O error".to_string()))
    }

    fn lookup(&self, key: &str) -> tractus_edge::Result<Option<LedgerEntry>> {
        self.0.lookup(key)
    }
}

/// Orchestrator wired to fake devices and an in-memory ledger
pub struct Harness {
    pub db: DbPool,
    pub ledger: IdempotencyRepo,
    pub modbus: Arc<FakeModbus>,
    pub opcua: Arc<CountingOpcUa>,
    pub counters: CounterSink,
    pub orchestrator: Orchestrator,
}

impl Default for Harness {
    fn default() -> Self {
        Self::with_modbus(FakeModbus::default())
    }
}

impl Harness {
    #[must_use]
    pub fn with_modbus(modbus: FakeModbus) -> Self {
        Self::with_ledger(modbus, |repo| Arc::new(repo) as Arc<dyn IdempotencyLedger>)
    }

    /// Harness whose orchestrator uses the ledger built by `wrap`
    #[must_use]
    pub fn with_ledger(
        modbus: FakeModbus,
        wrap: impl FnOnce(IdempotencyRepo) -> Arc<dyn IdempotencyLedger>,
    ) -> Self {
        let db = setup_test_db();
        let ledger = IdempotencyRepo::new(db.clone());
        let modbus = Arc::new(modbus);
        let opcua = Arc::new(CountingOpcUa::demo());
        let counters = CounterSink::new();

        let registry = CapabilityRegistry::with_builtins(
            modbus.clone(),
            opcua.clone(),
            DEFAULT_ENDPOINT,
            DEFAULT_DISPATCH_TIMEOUT,
        );
        let orchestrator = Orchestrator::new(
            wrap(ledger.clone()),
            Arc::new(registry),
            Arc::new(counters.clone()),
        );

        Self {
            db,
            ledger,
            modbus,
            opcua,
            counters,
            orchestrator,
        }
    }
}
