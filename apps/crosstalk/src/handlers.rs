//! HTTP surface: operability endpoints plus the narrow seams outside
//! collaborators call into the fan-out core.
//!
//! The `/internal/*` routes are how the rest of the platform reaches the
//! router. In particular, the message-send HTTP layer persists a row first
//! and only then posts it here for fan-out; this core never persists
//! anything itself.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::json;

use crate::protocol::{ConversationId, ServerMessage};
use crate::registry::SessionSummary;
use crate::AppState;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub active_connections: usize,
    pub sessions: Vec<SessionSummary>,
}

pub async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.registry.snapshot();
    Json(StatsResponse {
        active_connections: sessions.len(),
        sessions,
    })
}

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub store_id: String,
    pub active_conversations: Vec<ConversationId>,
}

/// Best-effort presence from the hint store. Approximate by design; never
/// used for routing decisions.
pub async fn store_presence(
    Path(store_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let active_conversations = state.hints.active_conversations(&store_id).await;
    Json(PresenceResponse {
        store_id,
        active_conversations,
    })
}

#[derive(Debug, Serialize)]
pub struct FanoutResponse {
    /// Local deliveries only. Zero is normal when every recipient is
    /// connected to a sibling process.
    pub delivered: usize,
}

/// Persistence collaborator seam: called after a message row is durably
/// saved; the body is the persisted row, fanned out verbatim.
pub async fn post_conversation_message(
    Path(conversation_id): Path<ConversationId>,
    State(state): State<AppState>,
    Json(message): Json<serde_json::Value>,
) -> impl IntoResponse {
    let delivered = state
        .router
        .send_to_conversation(conversation_id, &ServerMessage::NewMessage { message });
    Json(FanoutResponse { delivered })
}

pub async fn post_agents_broadcast(
    State(state): State<AppState>,
    Json(message): Json<ServerMessage>,
) -> impl IntoResponse {
    let delivered = state.router.broadcast_to_agents(&message);
    Json(FanoutResponse { delivered })
}

pub async fn post_store_broadcast(
    Path(store_id): Path<String>,
    State(state): State<AppState>,
    Json(message): Json<ServerMessage>,
) -> impl IntoResponse {
    let delivered = state.router.broadcast_to_store(&store_id, &message);
    Json(FanoutResponse { delivered })
}
