//! Best-effort presence hints in a shared key-value store.
//!
//! Two derived mappings: connection id -> store id, and the set of active
//! conversation ids per store. Any process can answer "does some process
//! have a live connection for store X" without a broadcast query. These
//! are cache hints, never a correctness dependency: fan-out correctness
//! comes from the bus, and the authoritative membership is the union of
//! all processes' local registries, which no single read can see. All
//! writes are fire-and-forget and failures are swallowed after a log line.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use crate::protocol::ConversationId;

pub type SharedHints = Arc<dyn HintStore>;

/// The hint seam, deliberately separate from the broadcast bus so the hint
/// can never be mistaken for the source of truth.
#[async_trait]
pub trait HintStore: Send + Sync {
    /// Record that a connection is serving a store's conversation.
    /// Fire-and-forget.
    fn record_binding(&self, connection_id: &str, store_id: &str, conversation_id: ConversationId);

    /// Drop a conversation from a store's active set. Callers only do this
    /// once no local session still holds the binding; cross-process overlap
    /// makes the set approximate, which is acceptable for a hint.
    fn clear_conversation(&self, store_id: &str, conversation_id: ConversationId);

    /// Drop the connection -> store mapping.
    fn clear_connection(&self, connection_id: &str);

    /// Best-effort read of a store's active conversation ids.
    async fn active_conversations(&self, store_id: &str) -> Vec<ConversationId>;

    /// Best-effort read of the store a connection was last bound to.
    async fn store_for_connection(&self, connection_id: &str) -> Option<String>;
}

/// Build the hint store for the configured mode, falling back to the
/// in-memory implementation when redis is unreachable (the hints are
/// non-authoritative, so running without shared hints beats not running).
pub async fn build_hint_store(standalone: bool, redis_url: &str, ttl_seconds: u64) -> SharedHints {
    if standalone {
        return Arc::new(MemoryHintStore::new());
    }
    match RedisHintStore::connect(redis_url, ttl_seconds).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            warn!(error = %err, "hint store cannot reach redis; using process-local hints");
            Arc::new(MemoryHintStore::new())
        }
    }
}

#[derive(Clone)]
pub struct RedisHintStore {
    redis: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisHintStore {
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis, ttl_seconds })
    }
}

#[async_trait]
impl HintStore for RedisHintStore {
    fn record_binding(&self, connection_id: &str, store_id: &str, conversation_id: ConversationId) {
        let mut conn = self.redis.clone();
        let ttl = self.ttl_seconds;
        let connection_key = connection_store_key(connection_id);
        let set_key = active_conversations_key(store_id);
        let store_id = store_id.to_string();
        tokio::spawn(async move {
            let result: redis::RedisResult<()> = redis::pipe()
                .cmd("SETEX")
                .arg(&connection_key)
                .arg(ttl)
                .arg(&store_id)
                .ignore()
                .cmd("SADD")
                .arg(&set_key)
                .arg(conversation_id)
                .ignore()
                .cmd("EXPIRE")
                .arg(&set_key)
                .arg(ttl)
                .ignore()
                .query_async(&mut conn)
                .await;
            if let Err(err) = result {
                warn!(error = %err, "failed to record store hint");
            }
        });
    }

    fn clear_conversation(&self, store_id: &str, conversation_id: ConversationId) {
        let mut conn = self.redis.clone();
        let set_key = active_conversations_key(store_id);
        tokio::spawn(async move {
            if let Err(err) = conn
                .srem::<_, _, ()>(&set_key, conversation_id)
                .await
            {
                warn!(error = %err, "failed to clear conversation hint");
            }
        });
    }

    fn clear_connection(&self, connection_id: &str) {
        let mut conn = self.redis.clone();
        let connection_key = connection_store_key(connection_id);
        tokio::spawn(async move {
            if let Err(err) = conn.del::<_, ()>(&connection_key).await {
                warn!(error = %err, "failed to clear connection hint");
            }
        });
    }

    async fn active_conversations(&self, store_id: &str) -> Vec<ConversationId> {
        let mut conn = self.redis.clone();
        let set_key = active_conversations_key(store_id);
        match conn.smembers::<_, Vec<ConversationId>>(&set_key).await {
            Ok(mut ids) => {
                ids.sort_unstable();
                ids
            }
            Err(err) => {
                warn!(error = %err, "failed to read active conversation hints");
                Vec::new()
            }
        }
    }

    async fn store_for_connection(&self, connection_id: &str) -> Option<String> {
        let mut conn = self.redis.clone();
        let connection_key = connection_store_key(connection_id);
        match conn.get::<_, Option<String>>(&connection_key).await {
            Ok(store) => store,
            Err(err) => {
                warn!(error = %err, "failed to read connection hint");
                None
            }
        }
    }
}

/// Process-local hints for standalone mode and tests.
#[derive(Default)]
pub struct MemoryHintStore {
    connections: Mutex<HashMap<String, String>>,
    conversations: Mutex<HashMap<String, BTreeSet<ConversationId>>>,
}

impl MemoryHintStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HintStore for MemoryHintStore {
    fn record_binding(&self, connection_id: &str, store_id: &str, conversation_id: ConversationId) {
        self.connections
            .lock()
            .insert(connection_id.to_string(), store_id.to_string());
        self.conversations
            .lock()
            .entry(store_id.to_string())
            .or_default()
            .insert(conversation_id);
    }

    fn clear_conversation(&self, store_id: &str, conversation_id: ConversationId) {
        if let Some(set) = self.conversations.lock().get_mut(store_id) {
            set.remove(&conversation_id);
        }
    }

    fn clear_connection(&self, connection_id: &str) {
        self.connections.lock().remove(connection_id);
    }

    async fn active_conversations(&self, store_id: &str) -> Vec<ConversationId> {
        self.conversations
            .lock()
            .get(store_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    async fn store_for_connection(&self, connection_id: &str) -> Option<String> {
        self.connections.lock().get(connection_id).cloned()
    }
}

fn connection_store_key(connection_id: &str) -> String {
    format!("crosstalk:connection:{}:store", connection_id)
}

fn active_conversations_key(store_id: &str) -> String {
    format!("crosstalk:store:{}:active_conversations", store_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_hints_track_active_conversations() {
        let hints = MemoryHintStore::new();
        hints.record_binding("conn-1", "store-1", 42);
        hints.record_binding("conn-2", "store-1", 99);
        hints.record_binding("conn-3", "store-2", 7);

        assert_eq!(hints.active_conversations("store-1").await, vec![42, 99]);
        assert_eq!(hints.active_conversations("store-2").await, vec![7]);
        assert_eq!(
            hints.store_for_connection("conn-1").await.as_deref(),
            Some("store-1")
        );

        hints.clear_conversation("store-1", 42);
        hints.clear_connection("conn-1");
        assert_eq!(hints.active_conversations("store-1").await, vec![99]);
        assert_eq!(hints.store_for_connection("conn-1").await, None);
    }

    #[tokio::test]
    async fn reads_for_unknown_stores_are_empty() {
        let hints = MemoryHintStore::new();
        assert!(hints.active_conversations("nowhere").await.is_empty());
        assert_eq!(hints.store_for_connection("nobody").await, None);
    }

    #[test]
    fn redis_keys_are_namespaced() {
        assert_eq!(
            connection_store_key("abc"),
            "crosstalk:connection:abc:store"
        );
        assert_eq!(
            active_conversations_key("store-1"),
            "crosstalk:store:store-1:active_conversations"
        );
    }
}
