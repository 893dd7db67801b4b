//! API route definitions.

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use crate::handlers::{events, health, trigger};
use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health::service_info))
        .route("/health", get(health::health))
        .route("/events", get(events::subscribe))
        .route("/trigger", post(trigger::trigger))
        .with_state(state)
}
