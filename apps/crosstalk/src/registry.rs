//! In-process connection registry.
//!
//! Maps connection ids to session metadata (role, conversation, store) and
//! the send half of each connection's writer channel. A session exists here
//! iff its transport is open from the registry's point of view: the
//! websocket handler registers on open and removes synchronously on
//! close/error, with no await between transport event and registry
//! mutation. Sends to a half-closed transport are non-fatal.
//!
//! The registry is owned by process bootstrap and injected everywhere it
//! is needed; tests construct isolated instances.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::protocol::{ConversationId, Role, ServerMessage};

pub type SessionSender = mpsc::UnboundedSender<ServerMessage>;
pub type SessionSendError = mpsc::error::SendError<ServerMessage>;

struct SessionEntry {
    role: Option<Role>,
    conversation_id: Option<ConversationId>,
    store_id: Option<String>,
    connected_at: DateTime<Utc>,
    tx: SessionSender,
}

/// A session's membership at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionBinding {
    pub role: Option<Role>,
    pub conversation_id: Option<ConversationId>,
    pub store_id: Option<String>,
}

/// Predicate for [`ConnectionRegistry::find`]. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub conversation_id: Option<ConversationId>,
    pub role: Option<Role>,
    pub store_id: Option<String>,
}

impl SessionFilter {
    pub fn conversation(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            ..Self::default()
        }
    }

    pub fn role(role: Role) -> Self {
        Self {
            role: Some(role),
            ..Self::default()
        }
    }

    pub fn store(store_id: &str) -> Self {
        Self {
            store_id: Some(store_id.to_string()),
            ..Self::default()
        }
    }
}

/// A live send handle produced by [`ConnectionRegistry::find`].
pub struct Recipient {
    pub connection_id: String,
    tx: SessionSender,
}

impl Recipient {
    /// Push a message onto the connection's writer channel. Fails only when
    /// the writer task has already gone away (socket closing); callers treat
    /// that as a skipped delivery, never as a fan-out failure.
    pub fn send(&self, message: ServerMessage) -> Result<(), SessionSendError> {
        self.tx.send(message)
    }
}

/// One row of the `/stats` snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub connection_id: String,
    pub role: Option<Role>,
    pub conversation_id: Option<ConversationId>,
    pub store_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<String, SessionEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly opened connection with no membership yet.
    pub fn register(&self, connection_id: &str, tx: SessionSender) {
        self.sessions.insert(
            connection_id.to_string(),
            SessionEntry {
                role: None,
                conversation_id: None,
                store_id: None,
                connected_at: Utc::now(),
                tx,
            },
        );
    }

    /// Bind a connection to a conversation, replacing any prior binding.
    /// Returns the previous binding so the caller can clear store hints, or
    /// `None` if the connection already closed in a race (silent no-op).
    pub fn attach_join(
        &self,
        connection_id: &str,
        role: Role,
        conversation_id: ConversationId,
        store_id: Option<String>,
    ) -> Option<SessionBinding> {
        let mut entry = self.sessions.get_mut(connection_id)?;
        let previous = SessionBinding {
            role: entry.role,
            conversation_id: entry.conversation_id,
            store_id: entry.store_id.clone(),
        };
        entry.role = Some(role);
        entry.conversation_id = Some(conversation_id);
        entry.store_id = store_id;
        Some(previous)
    }

    /// Delete a session. Idempotent; returns the final binding for hint
    /// cleanup when the session was still present.
    pub fn remove(&self, connection_id: &str) -> Option<SessionBinding> {
        self.sessions
            .remove(connection_id)
            .map(|(_, entry)| SessionBinding {
                role: entry.role,
                conversation_id: entry.conversation_id,
                store_id: entry.store_id,
            })
    }

    pub fn get(&self, connection_id: &str) -> Option<SessionBinding> {
        self.sessions.get(connection_id).map(|entry| SessionBinding {
            role: entry.role,
            conversation_id: entry.conversation_id,
            store_id: entry.store_id.clone(),
        })
    }

    /// Linear scan for sessions matching the filter. Fan-out happens per
    /// message-send event and conversation/store cardinalities stay in the
    /// tens-to-hundreds per process, so a scan is fine here.
    pub fn find(&self, filter: &SessionFilter) -> Vec<Recipient> {
        self.sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                filter
                    .conversation_id
                    .map_or(true, |id| session.conversation_id == Some(id))
                    && filter.role.map_or(true, |role| session.role == Some(role))
                    && filter
                        .store_id
                        .as_deref()
                        .map_or(true, |store| session.store_id.as_deref() == Some(store))
            })
            .map(|entry| Recipient {
                connection_id: entry.key().clone(),
                tx: entry.value().tx.clone(),
            })
            .collect()
    }

    /// True when any local session still holds this store/conversation
    /// binding. Used to avoid clearing a hint another connection owns.
    pub fn has_binding(&self, store_id: &str, conversation_id: ConversationId) -> bool {
        self.sessions.iter().any(|entry| {
            let session = entry.value();
            session.conversation_id == Some(conversation_id)
                && session.store_id.as_deref() == Some(store_id)
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .map(|entry| SessionSummary {
                connection_id: entry.key().clone(),
                role: entry.value().role,
                conversation_id: entry.value().conversation_id,
                store_id: entry.value().store_id.clone(),
                connected_at: entry.value().connected_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn channel() -> (SessionSender, UnboundedReceiver<ServerMessage>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn find_reflects_most_recent_join() {
        let registry = ConnectionRegistry::new();
        let (tx_a, _rx_a) = channel();
        let (tx_b, _rx_b) = channel();

        registry.register("a", tx_a);
        registry.register("b", tx_b);
        registry.attach_join("a", Role::Agent, 42, None);
        registry.attach_join("b", Role::Customer, 42, None);

        let mut matched: Vec<String> = registry
            .find(&SessionFilter::conversation(42))
            .into_iter()
            .map(|r| r.connection_id)
            .collect();
        matched.sort();
        assert_eq!(matched, vec!["a", "b"]);

        // Switching conversations replaces the binding, never appends.
        registry.attach_join("a", Role::Agent, 99, None);
        let matched: Vec<String> = registry
            .find(&SessionFilter::conversation(42))
            .into_iter()
            .map(|r| r.connection_id)
            .collect();
        assert_eq!(matched, vec!["b"]);

        registry.remove("b");
        assert!(registry.find(&SessionFilter::conversation(42)).is_empty());
    }

    #[test]
    fn attach_join_on_unknown_connection_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        assert!(registry.attach_join("gone", Role::Agent, 1, None).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        registry.register("a", tx);
        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
    }

    #[test]
    fn attach_join_returns_previous_binding() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        registry.register("a", tx);

        let first = registry
            .attach_join("a", Role::Agent, 42, Some("store-1".into()))
            .unwrap();
        assert_eq!(first.conversation_id, None);
        assert_eq!(first.store_id, None);

        let second = registry
            .attach_join("a", Role::Agent, 99, Some("store-2".into()))
            .unwrap();
        assert_eq!(second.conversation_id, Some(42));
        assert_eq!(second.store_id.as_deref(), Some("store-1"));
    }

    #[test]
    fn reconnection_reproduces_fanout_targeting() {
        let registry = ConnectionRegistry::new();
        let (tx_old, _rx_old) = channel();
        registry.register("old", tx_old);
        registry.attach_join("old", Role::Customer, 42, Some("store-1".into()));

        let before: Vec<String> = registry
            .find(&SessionFilter::conversation(42))
            .into_iter()
            .map(|r| r.connection_id)
            .collect();

        registry.remove("old");
        let (tx_new, _rx_new) = channel();
        registry.register("new", tx_new);
        registry.attach_join("new", Role::Customer, 42, Some("store-1".into()));

        let after: Vec<String> = registry
            .find(&SessionFilter::conversation(42))
            .into_iter()
            .map(|r| r.connection_id)
            .collect();

        assert_eq!(before.len(), after.len());
        assert_eq!(after, vec!["new"]);
    }

    #[test]
    fn filters_compose_by_role_and_store() {
        let registry = ConnectionRegistry::new();
        let (tx_a, _rx_a) = channel();
        let (tx_b, _rx_b) = channel();
        let (tx_c, _rx_c) = channel();
        registry.register("a", tx_a);
        registry.register("b", tx_b);
        registry.register("c", tx_c);
        registry.attach_join("a", Role::Agent, 1, Some("store-1".into()));
        registry.attach_join("b", Role::Customer, 1, Some("store-1".into()));
        registry.attach_join("c", Role::Agent, 2, Some("store-2".into()));

        let agents: Vec<String> = registry
            .find(&SessionFilter::role(Role::Agent))
            .into_iter()
            .map(|r| r.connection_id)
            .collect();
        assert_eq!(agents.len(), 2);

        let store_one: Vec<String> = registry
            .find(&SessionFilter::store("store-1"))
            .into_iter()
            .map(|r| r.connection_id)
            .collect();
        assert_eq!(store_one.len(), 2);

        assert!(registry.has_binding("store-2", 2));
        assert!(!registry.has_binding("store-2", 1));
    }

    #[test]
    fn freshly_registered_sessions_match_no_conversation() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        registry.register("a", tx);
        assert!(registry.find(&SessionFilter::conversation(42)).is_empty());
        assert_eq!(registry.len(), 1);
    }
}
