//! Cross-process broadcast bus for chat fan-out.
//!
//! Every server process publishes fan-out payloads onto named topics and
//! subscribes to the same topics for the lifetime of the process. A message
//! published by a process echoes back through its own subscription as well;
//! the subscriber side treats bus traffic exactly like a direct local
//! fan-out call, so sibling processes stay interchangeable.
//!
//! Delivery is at-least-once per process with best-effort FIFO within a
//! single topic from a single publisher. Nothing here is durable: a bus
//! outage degrades cross-process fan-out and leaves local delivery intact.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

mod redis_bus;

pub use crate::redis_bus::RedisBus;

/// One message received from (or published to) a bus topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Publish/subscribe seam between the router and the backing transport.
///
/// `publish` is fire-and-forget: implementations must not block the caller
/// on transport I/O, and a transport outage surfaces as a logged error, not
/// a failure in the request path. `subscribe` hands out an independent
/// receiver per call; topic granularity is coarse (one topic per fan-out
/// kind) so the number of live subscriptions stays bounded.
pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
    /// Stop delivery for a topic. Only used at process shutdown.
    fn unsubscribe(&self, topic: &str);
}

/// Per-topic receiver capacity. Fan-out events are small and consumed
/// promptly; a receiver that lags past this many messages skips ahead.
const TOPIC_CHANNEL_CAPACITY: usize = 256;

/// In-memory bus backed by `tokio::sync::broadcast` channels.
///
/// Used by tests and by standalone (single-process) deployments, where the
/// publish half simply loops straight back into the local subscription.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: parking_lot::RwLock<std::collections::HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(topic);
        // A topic with no subscribers is not an error for fire-and-forget
        // fan-out; the payload is simply dropped.
        let _ = sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) {
        self.topics.write().remove(topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("chat.fanout.conversations");
        bus.publish("chat.fanout.conversations", Bytes::from_static(b"{}"))
            .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "chat.fanout.conversations");
        assert_eq!(msg.payload, Bytes::from_static(b"{}"));
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_message() {
        let bus = LocalBus::new();
        let mut first = bus.subscribe("chat.fanout.agents");
        let mut second = bus.subscribe("chat.fanout.agents");
        bus.publish("chat.fanout.agents", Bytes::from_static(b"hello"))
            .expect("publish ok");
        assert_eq!(first.recv().await.unwrap().payload, &b"hello"[..]);
        assert_eq!(second.recv().await.unwrap().payload, &b"hello"[..]);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = LocalBus::new();
        bus.publish("chat.fanout.stores", Bytes::from_static(b"x"))
            .expect("fire-and-forget publish must not fail");
    }

    #[tokio::test]
    async fn unsubscribe_closes_existing_receivers() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("chat.fanout.agents");
        bus.unsubscribe("chat.fanout.agents");
        assert!(matches!(
            sub.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
