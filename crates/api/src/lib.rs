//! HTTP boundary for the order, truck and driver services.
//!
//! A process hosts any subset of the three services. Each keeps its own
//! store, consumer group and outbox relay; they share only the event
//! channel. The HTTP surface places and lists orders and lists resources for
//! the services hosted here, with structured logging (tracing) and
//! Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod seed;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use common::ResourceKind;
use event_channel::EventChannel;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{AssignmentManager, Dispatch, OrderSagaController, Service};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState<C> {
    pub orders: Arc<OrderSagaController<C>>,
    pub trucks: Arc<AssignmentManager<C>>,
    pub drivers: Arc<AssignmentManager<C>>,
    /// Services whose routes are mounted.
    pub services: Vec<Service>,
}

impl<C> AppState<C>
where
    C: EventChannel + 'static,
    C::Subscription: 'static,
{
    /// Exposes all services of a running dispatch.
    pub fn from_dispatch(dispatch: &Dispatch<C>) -> Self {
        Self {
            orders: dispatch.orders().clone(),
            trucks: dispatch.resources(ResourceKind::Truck).clone(),
            drivers: dispatch.resources(ResourceKind::Driver).clone(),
            services: Service::ALL.to_vec(),
        }
    }

    /// Restricts the mounted routes to `services`.
    pub fn with_services(mut self, services: Vec<Service>) -> Self {
        self.services = services;
        self
    }
}

impl<C> AppState<C> {
    pub fn runs(&self, service: Service) -> bool {
        self.services.contains(&service)
    }

    pub fn resources(&self, kind: ResourceKind) -> &Arc<AssignmentManager<C>> {
        match kind {
            ResourceKind::Truck => &self.trucks,
            ResourceKind::Driver => &self.drivers,
        }
    }
}

/// Creates the Axum application router: health and metrics, plus the routes
/// of each service the state hosts.
pub fn create_app<C: EventChannel + 'static>(
    state: Arc<AppState<C>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    let mut router = Router::new().route("/health", get(routes::health::check::<C>));
    if state.runs(Service::Order) {
        router = router
            .route("/api/orders/v1/create", post(routes::orders::create::<C>))
            .route("/api/orders/v1/list", get(routes::orders::list::<C>));
    }
    if state.runs(Service::Truck) {
        router = router.route("/api/trucks/v1/list", get(routes::resources::list_trucks::<C>));
    }
    if state.runs(Service::Driver) {
        router = router.route("/api/drivers/v1/list", get(routes::resources::list_drivers::<C>));
    }

    router
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
