//! Direct OPC UA pass-through endpoints
//!
//! These bypass validation and the idempotency ledger; use `/v1/commands`
//! for anything that must not repeat.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ApiError, ApiState, error_response};
use crate::protocol::ProtocolError;
use crate::protocol::opcua::DEMO_SPEED_NODE;

fn default_node_id() -> String {
    DEMO_SPEED_NODE.to_string()
}

#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    pub url: Option<String>,
    #[serde(default = "default_node_id")]
    pub node_id: String,
}

#[derive(Debug, Deserialize)]
pub struct WriteBody {
    pub url: Option<String>,
    #[serde(default = "default_node_id")]
    pub node_id: String,
    pub value: Value,
}

#[derive(Debug, Serialize)]
pub struct NodeValue {
    pub node_id: String,
    pub value: Value,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub ok: bool,
    pub node_id: String,
    pub value: Value,
}

fn device_error(operation: &str, e: &ProtocolError) -> ApiError {
    let status = if e.is_request_fault() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::BAD_GATEWAY
    };
    error_response(status, "device_error", format!("OPC UA {operation} failed: {e}"))
}

async fn read(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<NodeValue>, ApiError> {
    let endpoint = query.url.as_deref().unwrap_or(&state.opcua_endpoint);
    let value = state
        .opcua
        .read(endpoint, &query.node_id)
        .await
        .map_err(|e| device_error("read", &e))?;

    Ok(Json(NodeValue {
        node_id: query.node_id,
        value: value.into(),
    }))
}

async fn write(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<WriteBody>, JsonRejection>,
) -> Result<Json<WriteResponse>, ApiError> {
    let Json(body) =
        payload.map_err(|e| error_response(e.status(), "invalid_body", e.body_text()))?;
    let endpoint = body.url.as_deref().unwrap_or(&state.opcua_endpoint);
    let value = state
        .opcua
        .write(endpoint, &body.node_id, &body.value)
        .await
        .map_err(|e| device_error("write", &e))?;

    tracing::info!(node_id = %body.node_id, ?value, "direct opcua write");

    Ok(Json(WriteResponse {
        ok: true,
        node_id: body.node_id,
        value: value.into(),
    }))
}

/// Build the `/opcua` router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/read", get(read))
        .route("/write", post(write))
        .with_state(state)
}
