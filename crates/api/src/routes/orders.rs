//! Order service endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use common::ResourceId;
use domain::Order;
use event_channel::EventChannel;
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[serde(default)]
    pub truck_id: Option<String>,
    #[serde(default)]
    pub driver_id: Option<String>,
}

/// POST /api/orders/v1/create: place an order for a truck and a driver.
#[tracing::instrument(skip(state, body))]
pub async fn create<C: EventChannel + 'static>(
    State(state): State<Arc<AppState<C>>>,
    body: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let order = state
        .orders
        .create_order(
            ResourceId::new(req.truck_id.unwrap_or_default()),
            ResourceId::new(req.driver_id.unwrap_or_default()),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /api/orders/v1/list: every order, oldest first.
#[tracing::instrument(skip(state))]
pub async fn list<C: EventChannel + 'static>(
    State(state): State<Arc<AppState<C>>>,
) -> Result<Json<Vec<Order>>, ApiError> {
    Ok(Json(state.orders.list_orders().await?))
}
