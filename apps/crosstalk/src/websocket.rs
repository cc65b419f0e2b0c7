//! Per-connection websocket handling.
//!
//! Each connection runs a small state machine: `Connected` on transport
//! open, `Joined` once a valid join is processed, and closed when the
//! transport goes away. A dedicated writer task forwards server messages
//! from the session's channel to the socket; the receive loop below owns
//! all registry mutations and performs them synchronously within one
//! callback turn, never across an await, so join/close races on the same
//! connection cannot interleave.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{
    generate_connection_id, ClientMessage, ConversationId, Role, ServerMessage,
    CLIENT_MESSAGE_TYPES,
};
use crate::registry::{SessionBinding, SessionSender};
use crate::AppState;

enum SessionPhase {
    Connected,
    Joined,
}

pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = generate_connection_id();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer_connection = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(connection_id = %writer_connection, "writer task finished");
    });

    state.registry.register(&connection_id, tx.clone());
    counter!("crosstalk_connections_total", 1);
    gauge!("crosstalk_connections_active", state.registry.len() as f64);

    let _ = tx.send(ServerMessage::Connected {
        connection_id: connection_id.clone(),
    });
    debug!(connection_id = %connection_id, "websocket connected");

    let mut phase = SessionPhase::Connected;

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "websocket error");
                break;
            }
        };
        match frame {
            Message::Text(text) => handle_frame(&text, &connection_id, &mut phase, &state, &tx),
            // Some clients send JSON in binary frames; accept those too.
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => handle_frame(&text, &connection_id, &mut phase, &state, &tx),
                Err(_) => {
                    debug!(connection_id = %connection_id, "ignoring non-utf8 binary frame")
                }
            },
            Message::Close(_) => {
                debug!(connection_id = %connection_id, "received close frame");
                break;
            }
            // Transport-level ping/pong is answered by the websocket layer.
            _ => {}
        }
    }

    // Teardown is synchronous with the close event: once the loop exits,
    // the session leaves the registry before anything else can observe it.
    if let Some(binding) = state.registry.remove(&connection_id) {
        clear_contributed_hints(&state, &connection_id, &binding);
    }
    gauge!("crosstalk_connections_active", state.registry.len() as f64);
    writer.abort();
    debug!(connection_id = %connection_id, "websocket disconnected");
}

/// Parse and dispatch one inbound frame. No awaits in here: registry
/// mutations stay within this callback turn.
fn handle_frame(
    text: &str,
    connection_id: &str,
    phase: &mut SessionPhase,
    state: &AppState,
    tx: &SessionSender,
) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            if let Some(kind) = unknown_message_type(text) {
                // Forward-compatible no-op.
                debug!(connection_id = %connection_id, kind = %kind, "ignoring unknown message type");
            } else {
                warn!(connection_id = %connection_id, error = %err, "malformed client payload");
                let _ = tx.send(ServerMessage::Error {
                    message: format!("invalid message: {err}"),
                });
            }
            return;
        }
    };

    match message {
        ClientMessage::Join {
            conversation_id,
            role,
            store_id,
        } => handle_join(connection_id, phase, state, tx, conversation_id, role, store_id),
        ClientMessage::Typing {
            is_typing, sender, ..
        } => handle_typing(connection_id, phase, state, tx, is_typing, sender),
        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong);
        }
    }
}

fn handle_join(
    connection_id: &str,
    phase: &mut SessionPhase,
    state: &AppState,
    tx: &SessionSender,
    conversation_id: Option<ConversationId>,
    role: Option<Role>,
    store_id: Option<String>,
) {
    let (Some(conversation_id), Some(role)) = (conversation_id, role) else {
        let _ = tx.send(ServerMessage::Error {
            message: "join requires conversation_id and role".into(),
        });
        return;
    };

    let Some(previous) =
        state
            .registry
            .attach_join(connection_id, role, conversation_id, store_id.clone())
    else {
        // Connection already closed in a race; nothing to mutate.
        return;
    };
    *phase = SessionPhase::Joined;

    // Hint upkeep, all best-effort: drop the previous binding unless some
    // other local session still holds it, then record the new one.
    if let (Some(prev_store), Some(prev_conversation)) =
        (previous.store_id, previous.conversation_id)
    {
        let unchanged = store_id.as_deref() == Some(prev_store.as_str())
            && prev_conversation == conversation_id;
        if !unchanged && !state.registry.has_binding(&prev_store, prev_conversation) {
            state.hints.clear_conversation(&prev_store, prev_conversation);
        }
    }
    if let Some(store) = store_id.as_deref() {
        state
            .hints
            .record_binding(connection_id, store, conversation_id);
    }

    counter!("crosstalk_joins_total", 1, "role" => role_label(role));
    let _ = tx.send(ServerMessage::Joined {
        conversation_id,
        role,
    });
    debug!(
        connection_id = %connection_id,
        conversation_id,
        "connection joined conversation"
    );
}

fn handle_typing(
    connection_id: &str,
    phase: &mut SessionPhase,
    state: &AppState,
    tx: &SessionSender,
    is_typing: bool,
    sender: Option<String>,
) {
    if !matches!(phase, SessionPhase::Joined) {
        let _ = tx.send(ServerMessage::Error {
            message: "join a conversation before sending typing updates".into(),
        });
        return;
    }
    // The session's own binding decides where the indicator goes; the
    // client-sent conversation id is not trusted.
    let Some(conversation_id) = state
        .registry
        .get(connection_id)
        .and_then(|binding| binding.conversation_id)
    else {
        return;
    };
    let message = ServerMessage::AgentTyping {
        conversation_id,
        is_typing,
        sender,
    };
    state
        .router
        .deliver_to_conversation_except(conversation_id, connection_id, &message);
}

/// Clear the hints this connection contributed, keeping the conversation
/// hint alive while another local session still holds the same binding.
fn clear_contributed_hints(state: &AppState, connection_id: &str, binding: &SessionBinding) {
    state.hints.clear_connection(connection_id);
    if let (Some(store), Some(conversation)) = (binding.store_id.as_deref(), binding.conversation_id)
    {
        if !state.registry.has_binding(store, conversation) {
            state.hints.clear_conversation(store, conversation);
        }
    }
}

fn unknown_message_type(text: &str) -> Option<String> {
    let value = serde_json::from_str::<serde_json::Value>(text).ok()?;
    let kind = value.get("type")?.as_str()?;
    if CLIENT_MESSAGE_TYPES.contains(&kind) {
        None
    } else {
        Some(kind.to_string())
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::Customer => "customer",
        Role::Agent => "agent",
    }
}
