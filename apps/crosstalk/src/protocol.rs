//! Canonical wire schema for the chat relay.
//!
//! One tagged union keyed by `type`, snake_case on the wire. Older clients
//! send camelCase field names; those are normalized here at the boundary
//! via serde aliases and never leak downstream.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conversations are identified by the persistence collaborator's row id.
pub type ConversationId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Agent,
}

/// Generate a connection id. Unique for the lifetime of the process.
pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}

/// Messages sent from client to relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Attach this connection to a conversation. `conversation_id` and
    /// `role` are required; both are optional here so that a missing field
    /// produces a protocol error payload instead of a parse failure.
    Join {
        #[serde(default, alias = "conversationId")]
        conversation_id: Option<ConversationId>,
        #[serde(default)]
        role: Option<Role>,
        #[serde(default, alias = "storeId")]
        store_id: Option<String>,
    },
    /// Typing indicator. Routed to the conversation this connection is
    /// joined to; the client-sent conversation id is advisory only.
    Typing {
        #[serde(default, alias = "conversationId")]
        conversation_id: Option<ConversationId>,
        #[serde(default, alias = "isTyping")]
        is_typing: bool,
        #[serde(default)]
        sender: Option<String>,
    },
    /// Liveness probe for the client's own reconnect logic.
    Ping,
}

/// Message types this relay understands. Anything else on the wire is a
/// forward-compatible no-op rather than an error.
pub const CLIENT_MESSAGE_TYPES: &[&str] = &["join", "typing", "ping"];

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Greeting sent immediately after the transport opens.
    Connected { connection_id: String },
    /// Acknowledges a successful join.
    Joined {
        conversation_id: ConversationId,
        role: Role,
    },
    Error {
        message: String,
    },
    Pong,
    /// A message row persisted by the collaborator, fanned out verbatim.
    NewMessage {
        message: serde_json::Value,
    },
    /// Typing indicator echoed to the rest of the conversation.
    AgentTyping {
        conversation_id: ConversationId,
        is_typing: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
}
