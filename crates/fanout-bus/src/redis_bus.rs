//! Redis pub/sub backing for the broadcast bus.
//!
//! Two background tasks own all transport I/O so trait calls never block:
//! a publisher draining an unbounded queue through a `ConnectionManager`
//! (which reconnects on its own), and a subscriber holding a dedicated
//! pub/sub connection. The subscriber reconnects with exponential backoff;
//! while it is down, inbound cross-process messages are lost and outbound
//! publishes are dropped after the local delivery already happened.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::{Bus, BusError, BusMessage, BusResult, TOPIC_CHANNEL_CAPACITY};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

type TopicSenders = Arc<RwLock<HashMap<String, broadcast::Sender<BusMessage>>>>;

enum Control {
    /// The topic set changed; tear down the pub/sub connection and
    /// resubscribe with the current set.
    Resync,
}

pub struct RedisBus {
    topics: TopicSenders,
    publish_tx: mpsc::UnboundedSender<BusMessage>,
    control_tx: mpsc::UnboundedSender<Control>,
}

impl RedisBus {
    /// Connect to redis and spawn the publisher and subscriber tasks.
    /// Fails fast if redis is unreachable at startup; after that, outages
    /// are handled by reconnection and never surface to callers.
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client =
            redis::Client::open(url).map_err(|err| BusError::Transport(err.to_string()))?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;

        let topics: TopicSenders = Arc::new(RwLock::new(HashMap::new()));
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_publisher(publisher, publish_rx));
        tokio::spawn(run_subscriber(client, topics.clone(), control_rx));

        Ok(Self {
            topics,
            publish_tx,
            control_tx,
        })
    }

    fn resync(&self) {
        let _ = self.control_tx.send(Control::Resync);
    }
}

impl Bus for RedisBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        let mut changed = false;
        let receiver = {
            let mut guard = self.topics.write();
            guard
                .entry(topic.to_string())
                .or_insert_with(|| {
                    changed = true;
                    broadcast::channel(TOPIC_CHANNEL_CAPACITY).0
                })
                .subscribe()
        };
        if changed {
            self.resync();
        }
        receiver
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        self.publish_tx
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|_| BusError::Closed)
    }

    fn unsubscribe(&self, topic: &str) {
        if self.topics.write().remove(topic).is_some() {
            self.resync();
        }
    }
}

async fn run_publisher(mut conn: ConnectionManager, mut rx: mpsc::UnboundedReceiver<BusMessage>) {
    while let Some(msg) = rx.recv().await {
        let result: redis::RedisResult<()> = conn.publish(&msg.topic, msg.payload.as_ref()).await;
        if let Err(err) = result {
            // Dropped, not queued: the caller already delivered locally, so
            // an outage only degrades cross-process fan-out.
            warn!(
                topic = %msg.topic,
                error = %err,
                "dropping bus publish while redis is unavailable"
            );
        }
    }
    debug!("bus publisher task finished");
}

async fn run_subscriber(
    client: redis::Client,
    topics: TopicSenders,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                warn!(error = %err, "bus subscriber cannot reach redis; retrying");
                if wait_backoff(&mut control_rx, backoff).await {
                    return;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        let current: Vec<String> = topics.read().keys().cloned().collect();
        let mut subscribed = true;
        for topic in &current {
            if let Err(err) = pubsub.subscribe(topic).await {
                warn!(topic = %topic, error = %err, "bus topic subscribe failed; retrying");
                subscribed = false;
                break;
            }
        }
        if !subscribed {
            if wait_backoff(&mut control_rx, backoff).await {
                return;
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
            continue;
        }

        backoff = INITIAL_BACKOFF;
        debug!(topics = current.len(), "bus subscriber connected");

        let mut stream = pubsub.into_on_message();
        loop {
            tokio::select! {
                control = control_rx.recv() => match control {
                    // Topic set changed; reconnect with the current set.
                    Some(Control::Resync) => break,
                    // Bus handle dropped; shut the task down.
                    None => return,
                },
                msg = stream.next() => match msg {
                    Some(msg) => dispatch(&topics, msg),
                    None => {
                        warn!("bus pub/sub connection lost; reconnecting");
                        break;
                    }
                },
            }
        }
    }
}

fn dispatch(topics: &TopicSenders, msg: redis::Msg) {
    let topic = msg.get_channel_name().to_string();
    let sender = topics.read().get(&topic).cloned();
    if let Some(sender) = sender {
        // No receivers is fine; fan-out is fire-and-forget.
        let _ = sender.send(BusMessage {
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
            topic,
        });
    }
}

/// Sleep for `delay`, waking early if the bus handle is dropped.
/// Returns true when the subscriber should shut down.
async fn wait_backoff(control_rx: &mut mpsc::UnboundedReceiver<Control>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        control = control_rx.recv() => control.is_none(),
    }
}
