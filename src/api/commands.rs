//! Command endpoints
//!
//! | route                           | success | failure                                  |
//! |---------------------------------|---------|------------------------------------------|
//! | `POST /v1/commands/validate`    | 200     | 422 validation                           |
//! | `POST /v1/commands/execute`     | 200     | 400 dispatch, 409 in flight, 422, 500    |
//! | `GET /v1/idempotency/{key}`     | 200     | 404 unknown key, 500                     |

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};

use super::{ApiError, ApiState, ErrorDetail, ErrorResponse, error_response};
use crate::command::{Command, RawCommand, ValidationError};
use crate::db::IdempotencyRecord;
use crate::orchestrator::{ExecuteError, Outcome};

/// Set on responses answered from the ledger
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

fn validation_response(e: &ValidationError) -> ApiError {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ErrorResponse {
            error: ErrorDetail {
                code: "validation_error",
                message: e.to_string(),
                field: Some(e.field),
            },
        }),
    )
}

fn body(payload: Result<Json<RawCommand>, JsonRejection>) -> Result<RawCommand, ApiError> {
    payload.map(|Json(raw)| raw).map_err(|e| {
        validation_response(&ValidationError {
            field: "body",
            reason: e.body_text(),
        })
    })
}

/// Validate only; echoes the normalized command
async fn validate_command(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<RawCommand>, JsonRejection>,
) -> Result<Json<Command>, ApiError> {
    let raw = body(payload)?;
    state
        .orchestrator
        .validate(raw)
        .map(Json)
        .map_err(|e| validation_response(&e))
}

/// Validate, deduplicate, and dispatch
async fn execute_command(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<RawCommand>, JsonRejection>,
) -> Result<Response, ApiError> {
    let raw = body(payload)?;

    let outcome = state.orchestrator.execute(raw).await.map_err(|e| match e {
        ExecuteError::Validation(e) => validation_response(&e),
        ExecuteError::Storage(e) => {
            tracing::error!(error = %e, "ledger failure during execute");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "idempotency ledger unavailable",
            )
        }
    })?;

    let replayed = outcome.is_replay();
    let mut response = match outcome {
        Outcome::Completed { payload, .. } => (StatusCode::OK, Json(payload)).into_response(),
        Outcome::Failed { payload, .. } => (StatusCode::BAD_REQUEST, Json(payload)).into_response(),
        Outcome::InFlight { key } => {
            return Err(error_response(
                StatusCode::CONFLICT,
                "in_flight",
                format!("command with idempotency key {key} has not finished; retry later"),
            ));
        }
    };

    if replayed {
        response
            .headers_mut()
            .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    }
    Ok(response)
}

/// Inspect the ledger record for a key
async fn get_record(
    State(state): State<Arc<ApiState>>,
    Path(key): Path<String>,
) -> Result<Json<IdempotencyRecord>, ApiError> {
    let ledger = state.ledger.clone();
    let lookup_key = key.clone();

    let record = tokio::task::spawn_blocking(move || ledger.get(&lookup_key))
        .await
        .map_err(|e| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string())
        })?
        .map_err(|e| {
            tracing::error!(error = %e, "ledger read failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string())
        })?;

    record.map(Json).ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no record for idempotency key {key}"),
        )
    })
}

/// Build the `/v1` router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/commands/validate", post(validate_command))
        .route("/commands/execute", post(execute_command))
        .route("/idempotency/{key}", get(get_record))
        .with_state(state)
}
