//! Health check and stats endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use super::ApiState;
use crate::events::EventCounts;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Detailed readiness response
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub checks: ReadinessChecks,
}

/// Individual readiness checks
#[derive(Serialize)]
pub struct ReadinessChecks {
    pub ledger: CheckResult,
}

/// Result of a single health check
#[derive(Serialize)]
pub struct CheckResult {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckResult {
    const fn ok() -> Self {
        Self {
            status: "ok",
            message: None,
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            status: "fail",
            message: Some(message.into()),
        }
    }
}

/// Command counters and registered capabilities
#[derive(Serialize)]
pub struct StatsResponse {
    pub version: &'static str,
    pub capabilities: Vec<String>,
    pub commands: EventCounts,
}

/// Liveness probe
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe: can the ledger be queried?
async fn ready(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let db = state.db.clone();
    let ledger = tokio::task::spawn_blocking(move || check_ledger(&db))
        .await
        .unwrap_or_else(|e| CheckResult::fail(format!("check task failed: {e}")));

    let ok = ledger.status == "ok";
    let http_status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(ReadinessResponse {
            status: if ok { "ok" } else { "degraded" },
            checks: ReadinessChecks { ledger },
        }),
    )
}

/// Check ledger connectivity
fn check_ledger(db: &crate::db::DbPool) -> CheckResult {
    match db.get() {
        Ok(conn) => match conn.query_row("SELECT COUNT(*) FROM idempotency", [], |_| Ok(())) {
            Ok(()) => CheckResult::ok(),
            Err(e) => CheckResult::fail(format!("query failed: {e}")),
        },
        Err(e) => CheckResult::fail(format!("connection failed: {e}")),
    }
}

async fn stats(State(state): State<Arc<ApiState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        version: env!("CARGO_PKG_VERSION"),
        capabilities: state
            .orchestrator
            .registry()
            .capabilities()
            .into_iter()
            .map(str::to_string)
            .collect(),
        commands: state.counters.snapshot(),
    })
}

/// Build health router (liveness only, no state needed)
pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

/// Build readiness and stats router
pub fn ready_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .route("/api/stats", get(stats))
        .with_state(state)
}
