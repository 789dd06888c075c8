//! HTTP API server for the edge gateway

mod auth;
pub mod commands;
pub mod devices;
pub mod health;
pub mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router, http::StatusCode};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::db::{DbPool, IdempotencyRepo};
use crate::dispatch::{CapabilityRegistry, DEFAULT_DISPATCH_TIMEOUT};
use crate::events::CounterSink;
use crate::orchestrator::Orchestrator;
use crate::protocol::opcua::DEFAULT_ENDPOINT;
use crate::protocol::{
    ModbusExecutor, ModbusSessionPool, OfflineOpcUa, OpcUaExecutor, SimulatedOpcUa,
};

/// Default request body limit
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub api_key: Option<String>,
    pub orchestrator: Arc<Orchestrator>,
    pub ledger: IdempotencyRepo,
    pub counters: CounterSink,
    pub opcua: Arc<dyn OpcUaExecutor>,
    pub opcua_endpoint: String,
    pub rate_limiter: Option<rate_limit::SharedLimiter>,
}

/// JSON error body: `{"error": {"code", "message", "field"?}}`
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<&'static str>,
}

pub(crate) type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
                field: None,
            },
        }),
    )
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    db: DbPool,
    port: u16,
    api_key: Option<String>,
    modbus: Option<Arc<dyn ModbusExecutor>>,
    opcua: Option<Arc<dyn OpcUaExecutor>>,
    opcua_endpoint: String,
    simulate_opcua: bool,
    dispatch_timeout: Duration,
    connect_timeout: Duration,
    rate_limit_per_minute: Option<u32>,
    max_body_bytes: usize,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub fn new(db: DbPool, port: u16) -> Self {
        Self {
            db,
            port,
            api_key: None,
            modbus: None,
            opcua: None,
            opcua_endpoint: DEFAULT_ENDPOINT.to_string(),
            simulate_opcua: false,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            connect_timeout: Duration::from_secs(2),
            rate_limit_per_minute: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Require this bearer key on `/v1/*`
    #[must_use]
    pub fn api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    /// Use a specific Modbus executor instead of the session pool
    #[must_use]
    pub fn modbus(mut self, executor: Arc<dyn ModbusExecutor>) -> Self {
        self.modbus = Some(executor);
        self
    }

    /// Use a specific OPC UA executor
    #[must_use]
    pub fn opcua(mut self, executor: Arc<dyn OpcUaExecutor>) -> Self {
        self.opcua = Some(executor);
        self
    }

    /// Endpoint used when a command names none
    #[must_use]
    pub fn opcua_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.opcua_endpoint = endpoint.into();
        self
    }

    /// Serve OPC UA from the in-memory demo address space when no executor
    /// is set; otherwise every OPC UA call fails with a connect error
    #[must_use]
    pub const fn simulate_opcua(mut self, simulate: bool) -> Self {
        self.simulate_opcua = simulate;
        self
    }

    #[must_use]
    pub const fn dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn rate_limit_per_minute(mut self, limit: Option<u32>) -> Self {
        self.rate_limit_per_minute = limit;
        self
    }

    #[must_use]
    pub const fn max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        let modbus = self.modbus.unwrap_or_else(|| {
            Arc::new(ModbusSessionPool::new(
                self.connect_timeout,
                self.dispatch_timeout,
            ))
        });
        let opcua: Arc<dyn OpcUaExecutor> = match self.opcua {
            Some(executor) => executor,
            None if self.simulate_opcua => {
                tracing::warn!(
                    endpoint = %self.opcua_endpoint,
                    "OPC UA is simulated in memory, no device is written"
                );
                Arc::new(SimulatedOpcUa::demo(self.opcua_endpoint.clone()))
            }
            None => Arc::new(OfflineOpcUa),
        };

        let registry = Arc::new(CapabilityRegistry::with_builtins(
            modbus,
            Arc::clone(&opcua),
            self.opcua_endpoint.clone(),
            self.dispatch_timeout,
        ));
        tracing::debug!(capabilities = ?registry.capabilities(), "capabilities registered");

        let ledger = IdempotencyRepo::new(self.db.clone());
        let counters = CounterSink::new();
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(ledger.clone()),
            registry,
            Arc::new(counters.clone()),
        ));

        let state = Arc::new(ApiState {
            db: self.db,
            api_key: self.api_key,
            orchestrator,
            ledger,
            counters,
            opcua,
            opcua_endpoint: self.opcua_endpoint,
            rate_limiter: self.rate_limit_per_minute.map(rate_limit::create_limiter),
        });

        ApiServer {
            state,
            port: self.port,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
    max_body_bytes: usize,
}

impl ApiServer {
    #[must_use]
    pub const fn state(&self) -> &Arc<ApiState> {
        &self.state
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let v1 = commands::router(self.state.clone()).route_layer(
            axum::middleware::from_fn_with_state(self.state.clone(), auth::require_api_key),
        );

        let router = Router::new()
            .nest("/v1", v1)
            .nest("/opcua", devices::router(self.state.clone()))
            .merge(health::router())
            .merge(health::ready_router(self.state.clone()));

        let router = router.layer(axum::middleware::from_fn_with_state(
            self.state.clone(),
            rate_limit::rate_limit_middleware,
        ));

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router
            .layer(RequestBodyLimitLayer::new(self.max_body_bytes))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        if self.state.api_key.is_none() {
            tracing::warn!("no API key configured, /v1 is unauthenticated");
        }

        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
