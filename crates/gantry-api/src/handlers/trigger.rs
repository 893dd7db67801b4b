//! Pipeline trigger handler.

use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use gantry_core::events::{Event, EventType};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::info;

/// Accept a YAML pipeline document and run it in the background.
pub async fn trigger(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "Empty pipeline configuration").into_response();
    }

    info!(bytes = body.len(), "Received pipeline trigger request");

    let mut data = Map::new();
    data.insert(
        "message".to_string(),
        Value::String("Pipeline trigger request received".to_string()),
    );
    data.insert(
        "source".to_string(),
        Value::String("http_endpoint".to_string()),
    );
    state
        .broadcaster
        .broadcast(Event::new(EventType::PipelineTrigger, data));

    if let Err(e) = state.spawn_pipeline(body.to_vec()) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "error",
                "error": e.to_string(),
                "timestamp": chrono::Utc::now(),
            })),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "accepted",
            "message": "Pipeline execution started",
            "timestamp": chrono::Utc::now(),
        })),
    )
        .into_response()
}
