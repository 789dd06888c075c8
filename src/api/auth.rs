//! Bearer API key check for command routes

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::{ApiState, error_response};

/// Extract API key from Authorization header
fn extract_api_key(req: &Request) -> Option<&str> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Reject requests without the configured key; open when none is configured
pub async fn require_api_key(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected_key) = &state.api_key else {
        return next.run(req).await;
    };

    match extract_api_key(&req) {
        Some(key) if key == expected_key => next.run(req).await,
        Some(_) => {
            tracing::warn!(path = %req.uri().path(), "invalid API key provided");
            error_response(StatusCode::UNAUTHORIZED, "unauthorized", "invalid API key")
                .into_response()
        }
        None => {
            tracing::debug!(path = %req.uri().path(), "no API key provided");
            error_response(StatusCode::UNAUTHORIZED, "unauthorized", "missing bearer token")
                .into_response()
        }
    }
}
