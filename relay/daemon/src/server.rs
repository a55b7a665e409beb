//! HTTP surface
//!
//! ```text
//!   POST /ask     ──► StreamController::open ──► text/event-stream body
//!   HEAD /ask     ──► 200, route liveness
//!   GET  /health  ──► reservation and session counts
//! ```
//!
//! Duplicates of a completed message are answered with the stored outcome
//! as plain JSON; duplicates of an in-flight message get 409.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use thiserror::Error;
use tokio_stream::StreamExt;

use relay_core::transport::SSE_HEADERS;
use relay_core::{RelayError, ReservationStatus, StreamController, StreamRequest};

/// Header echoing the admitted client message id
pub const CLIENT_MESSAGE_ID_HEADER: &str = "x-relay-client-message-id";
/// Header carrying the server stream id
pub const STREAM_ID_HEADER: &str = "x-relay-stream-id";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    /// Stream admission and sessions
    pub controller: Arc<StreamController>,
}

/// Handler errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Admission failed
    #[error(transparent)]
    Relay(#[from] RelayError),
    /// Body was not JSON
    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// Response could not be assembled
    #[error("failed to build response: {0}")]
    Response(#[from] axum::http::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Relay(RelayError::Duplicate {
                key,
                status: ReservationStatus::Completed,
                outcome,
            }) => {
                tracing::info!(key = %key, "Replayed completed client message");
                let body = json!({
                    "status": "duplicate",
                    "state": "completed",
                    "outcome": outcome,
                });
                (StatusCode::OK, Json(body)).into_response()
            }
            Self::Relay(RelayError::Duplicate { .. } | RelayError::InteractionBusy { .. }) => {
                let body = json!({ "status": "duplicate", "state": "active" });
                (StatusCode::CONFLICT, Json(body)).into_response()
            }
            Self::Relay(RelayError::InvalidRequest(message)) => {
                let body = json!({ "error": { "code": "INVALID_REQUEST", "message": message } });
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            Self::InvalidJson(e) => {
                let body = json!({ "error": { "code": "INVALID_JSON", "message": e.to_string() } });
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            Self::Relay(e @ RelayError::Config(_)) => internal_error(&e.to_string()),
            Self::Response(e) => internal_error(&e.to_string()),
        }
    }
}

fn internal_error(message: &str) -> Response {
    tracing::error!(error = %message, "Request failed");
    let body = json!({ "error": { "code": "INTERNAL", "message": message } });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ask", post(ask).head(ask_head))
        .route("/health", get(health))
        .with_state(state)
}

async fn ask(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Response, ApiError> {
    let body: serde_json::Value = serde_json::from_slice(&body)?;
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let request = StreamRequest::from_parts(header, &body)?;
    let opened = state.controller.open(request).await?;

    let mut builder = Response::builder().status(StatusCode::OK);
    for (name, value) in SSE_HEADERS {
        builder = builder.header(name, value);
    }
    if let Ok(value) = HeaderValue::from_str(&opened.stream_id) {
        builder = builder.header(STREAM_ID_HEADER, value);
    }
    if let Some(value) = opened
        .client_message_id
        .as_deref()
        .and_then(|id| HeaderValue::from_str(id).ok())
    {
        builder = builder.header(CLIENT_MESSAGE_ID_HEADER, value);
    }

    let stream = opened.into_body_stream().map(Ok::<_, Infallible>);
    Ok(builder.body(Body::from_stream(stream))?)
}

async fn ask_head() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "text/event-stream; charset=utf-8")])
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.controller.stats();
    Json(json!({ "status": "ok", "stats": stats }))
}
