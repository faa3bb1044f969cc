//! Truck and driver service endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use common::ResourceKind;
use domain::Resource;
use event_channel::EventChannel;

use crate::AppState;
use crate::error::ApiError;

/// GET /api/trucks/v1/list
pub async fn list_trucks<C: EventChannel + 'static>(
    State(state): State<Arc<AppState<C>>>,
) -> Result<Json<Vec<Resource>>, ApiError> {
    list(&state, ResourceKind::Truck).await
}

/// GET /api/drivers/v1/list
pub async fn list_drivers<C: EventChannel + 'static>(
    State(state): State<Arc<AppState<C>>>,
) -> Result<Json<Vec<Resource>>, ApiError> {
    list(&state, ResourceKind::Driver).await
}

async fn list<C: EventChannel + 'static>(
    state: &AppState<C>,
    kind: ResourceKind,
) -> Result<Json<Vec<Resource>>, ApiError> {
    let resources = state.resources(kind).list_resources().await?;
    Ok(Json(resources))
}
