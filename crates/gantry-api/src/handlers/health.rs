//! Service descriptor and health check handlers.

use crate::state::AppState;
use axum::{Json, extract::State};
use serde_json::{Value, json};
use std::sync::Arc;

pub async fn service_info() -> Json<Value> {
    Json(json!({
        "service": "Gantry Daemon",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "/events": "Server-Sent Events endpoint for real-time pipeline updates",
            "/health": "Health check endpoint",
            "/trigger": "POST endpoint to trigger pipeline execution with YAML configuration",
        },
        "timestamp": chrono::Utc::now(),
    }))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "clients": state.broadcaster.subscriber_count(),
        "timestamp": chrono::Utc::now(),
    }))
}
