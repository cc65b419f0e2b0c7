//! Message router: the public fan-out API.
//!
//! Every public operation is two separable sub-steps: deliver to matching
//! local registry entries, then publish to the bus so sibling processes
//! reach their own connections. The bus ingest path re-enters ONLY the
//! local-delivery half; re-publishing there would relay the message back
//! onto the bus and loop it between processes forever.
//!
//! Fan-out is fire-and-forget per connection: a write to one half-closed
//! socket is logged and skipped, never aborting delivery to the rest of
//! the matched set. Callers get back the local delivery count; zero local
//! deliveries is not an error, the recipient may be on another process.

use std::sync::Arc;

use fanout_bus::Bus;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{ConversationId, Role, ServerMessage};
use crate::registry::{ConnectionRegistry, Recipient, SessionFilter};

pub const TOPIC_CONVERSATIONS: &str = "crosstalk.fanout.conversations";
pub const TOPIC_AGENTS: &str = "crosstalk.fanout.agents";
pub const TOPIC_STORES: &str = "crosstalk.fanout.stores";

/// Topics every process subscribes to for its whole lifetime. Granularity
/// is deliberately coarse; the envelope carries the fine-grained scope.
pub const FANOUT_TOPICS: &[&str] = &[TOPIC_CONVERSATIONS, TOPIC_AGENTS, TOPIC_STORES];

/// What travels on the bus: the fan-out scope plus the payload to deliver.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
enum FanoutEnvelope {
    Conversation {
        conversation_id: ConversationId,
        payload: ServerMessage,
    },
    Agents {
        payload: ServerMessage,
    },
    Store {
        store_id: String,
        payload: ServerMessage,
    },
}

#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    bus: Arc<dyn Bus>,
}

impl MessageRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, bus: Arc<dyn Bus>) -> Self {
        Self { registry, bus }
    }

    /// Deliver to every local session in the conversation, then publish for
    /// sibling processes. Returns the local delivery count.
    pub fn send_to_conversation(
        &self,
        conversation_id: ConversationId,
        message: &ServerMessage,
    ) -> usize {
        let delivered = self.deliver_to_conversation(conversation_id, message);
        self.publish(
            TOPIC_CONVERSATIONS,
            &FanoutEnvelope::Conversation {
                conversation_id,
                payload: message.clone(),
            },
        );
        delivered
    }

    /// Deliver to every local agent session, then publish.
    pub fn broadcast_to_agents(&self, message: &ServerMessage) -> usize {
        let delivered = self.deliver_to_agents(message);
        self.publish(
            TOPIC_AGENTS,
            &FanoutEnvelope::Agents {
                payload: message.clone(),
            },
        );
        delivered
    }

    /// Deliver to every local session bound to the store, then publish.
    pub fn broadcast_to_store(&self, store_id: &str, message: &ServerMessage) -> usize {
        let delivered = self.deliver_to_store(store_id, message);
        self.publish(
            TOPIC_STORES,
            &FanoutEnvelope::Store {
                store_id: store_id.to_string(),
                payload: message.clone(),
            },
        );
        delivered
    }

    /// Local-delivery half of [`send_to_conversation`]. The bus ingest path
    /// calls this directly and must never publish.
    pub fn deliver_to_conversation(
        &self,
        conversation_id: ConversationId,
        message: &ServerMessage,
    ) -> usize {
        let recipients = self
            .registry
            .find(&SessionFilter::conversation(conversation_id));
        self.deliver(recipients, message, None, "conversation")
    }

    pub fn deliver_to_agents(&self, message: &ServerMessage) -> usize {
        let recipients = self.registry.find(&SessionFilter::role(Role::Agent));
        self.deliver(recipients, message, None, "agents")
    }

    pub fn deliver_to_store(&self, store_id: &str, message: &ServerMessage) -> usize {
        let recipients = self.registry.find(&SessionFilter::store(store_id));
        self.deliver(recipients, message, None, "store")
    }

    /// Typing fan-out: every other local session in the conversation. The
    /// sender never receives its own typing echo.
    pub fn deliver_to_conversation_except(
        &self,
        conversation_id: ConversationId,
        exclude_connection_id: &str,
        message: &ServerMessage,
    ) -> usize {
        let recipients = self
            .registry
            .find(&SessionFilter::conversation(conversation_id));
        self.deliver(recipients, message, Some(exclude_connection_id), "typing")
    }

    fn deliver(
        &self,
        recipients: Vec<Recipient>,
        message: &ServerMessage,
        exclude: Option<&str>,
        kind: &'static str,
    ) -> usize {
        let mut delivered = 0usize;
        for recipient in recipients {
            if exclude == Some(recipient.connection_id.as_str()) {
                continue;
            }
            match recipient.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    // Writer task already gone; the close event will remove
                    // the entry. Skip and keep delivering to the rest.
                    debug!(
                        connection_id = %recipient.connection_id,
                        "skipping fan-out write to closing connection"
                    );
                    counter!("crosstalk_fanout_skipped_writes_total", 1, "kind" => kind);
                }
            }
        }
        if delivered > 0 {
            counter!(
                "crosstalk_fanout_deliveries_total",
                delivered as u64,
                "kind" => kind
            );
        }
        delivered
    }

    fn publish(&self, topic: &'static str, envelope: &FanoutEnvelope) {
        let bytes = match serde_json::to_vec(envelope) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(topic, error = %err, "failed to encode fan-out envelope");
                return;
            }
        };
        // Local delivery already happened; a bus outage degrades
        // cross-process fan-out only.
        if let Err(err) = self.bus.publish(topic, bytes.into()) {
            warn!(topic, error = %err, "bus publish failed");
        }
        counter!("crosstalk_bus_published_total", 1, "topic" => topic);
    }

    /// Subscribe to the fan-out topics and route received envelopes into
    /// the local-delivery path, one task per topic, for the process
    /// lifetime.
    pub fn spawn_bus_ingest(&self) -> Vec<JoinHandle<()>> {
        FANOUT_TOPICS
            .iter()
            .map(|&topic| {
                let mut sub = self.bus.subscribe(topic);
                let router = self.clone();
                tokio::spawn(async move {
                    loop {
                        match sub.recv().await {
                            Ok(msg) => router.ingest(topic, &msg.payload),
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(topic, skipped, "bus ingest lagged; messages skipped");
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                    debug!(topic, "bus ingest task finished");
                })
            })
            .collect()
    }

    /// Handle one bus message: local delivery only, no re-publish.
    fn ingest(&self, topic: &'static str, payload: &[u8]) {
        let envelope = match serde_json::from_slice::<FanoutEnvelope>(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(topic, error = %err, "ignoring malformed fan-out envelope");
                return;
            }
        };
        counter!("crosstalk_bus_ingested_total", 1, "topic" => topic);
        match envelope {
            FanoutEnvelope::Conversation {
                conversation_id,
                payload,
            } => {
                self.deliver_to_conversation(conversation_id, &payload);
            }
            FanoutEnvelope::Agents { payload } => {
                self.deliver_to_agents(&payload);
            }
            FanoutEnvelope::Store { store_id, payload } => {
                self.deliver_to_store(&store_id, &payload);
            }
        }
    }

    /// Shutdown-time teardown of the process-lifetime subscriptions.
    pub fn unsubscribe_all(&self) {
        for topic in FANOUT_TOPICS {
            self.bus.unsubscribe(topic);
        }
    }
}
