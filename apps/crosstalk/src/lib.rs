//! crosstalk: multi-tenant chat fan-out relay.
//!
//! The core of the relay is a per-process connection registry, a router
//! that fans messages out to matching local connections and onto a
//! cross-process broadcast bus, and a websocket session handler that keeps
//! registry membership in sync with connection lifecycle. Horizontal
//! scaling works because every process's bus subscription feeds the same
//! local-delivery path that direct router calls use.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod hints;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod telemetry;
pub mod websocket;

use std::sync::Arc;

use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::hints::SharedHints;
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;

/// Everything the HTTP and websocket handlers need, built once in
/// bootstrap and injected. The registry is deliberately not a global so
/// tests can construct isolated instances.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub router: MessageRouter,
    pub hints: SharedHints,
    pub metrics: Option<PrometheusHandle>,
}

pub fn app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/stats", get(handlers::stats_handler))
        .route("/stores/:store_id/presence", get(handlers::store_presence))
        .route(
            "/internal/conversations/:conversation_id/messages",
            post(handlers::post_conversation_message),
        )
        .route(
            "/internal/agents/broadcast",
            post(handlers::post_agents_broadcast),
        )
        .route(
            "/internal/stores/:store_id/broadcast",
            post(handlers::post_store_broadcast),
        )
        .route("/ws", get(websocket::websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
