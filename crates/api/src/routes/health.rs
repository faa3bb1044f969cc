//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use event_channel::EventChannel;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// The order, truck and driver services this process runs.
    pub services: Vec<&'static str>,
}

/// GET /health: liveness of the order, truck and driver services hosted here.
pub async fn check<C: EventChannel + 'static>(
    State(state): State<Arc<AppState<C>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        services: state.services.iter().map(|s| s.as_str()).collect(),
    })
}
