//! Shared harness: spin up a relay on an ephemeral port and drive it with
//! real websocket clients.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fanout_bus::{Bus, LocalBus};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crosstalk::hints::MemoryHintStore;
use crosstalk::registry::ConnectionRegistry;
use crosstalk::router::MessageRouter;
use crosstalk::{app, AppState};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Bind a relay on an ephemeral port, sharing `bus` with any sibling
/// servers the test spawns.
pub async fn spawn_server(bus: Arc<dyn Bus>) -> TestServer {
    let registry = Arc::new(ConnectionRegistry::new());
    let router = MessageRouter::new(registry.clone(), bus);
    // Detached on purpose; the tasks die with the test runtime.
    let _ingest = router.spawn_bus_ingest();
    let state = AppState {
        registry,
        router,
        hints: Arc::new(MemoryHintStore::new()),
        metrics: None,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    TestServer { addr, state }
}

pub async fn spawn_standalone_server() -> TestServer {
    spawn_server(Arc::new(LocalBus::new())).await
}

/// Open a websocket and consume the greeting, returning the assigned
/// connection id alongside the client.
pub async fn connect_client(addr: SocketAddr) -> (WsClient, String) {
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket connect");
    let greeting = recv_json(&mut ws).await;
    assert_eq!(greeting["type"], "connected");
    let connection_id = greeting["connection_id"]
        .as_str()
        .expect("connection id")
        .to_string();
    (ws, connection_id)
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("websocket send");
}

pub async fn recv_json(ws: &mut WsClient) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a server message")
            .expect("websocket stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("server sent invalid json");
        }
    }
}

/// Assert that no text frame arrives within a short window.
pub async fn assert_silent(ws: &mut WsClient) {
    let outcome = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    match outcome {
        Err(_) => {}
        Ok(Some(Ok(Message::Text(text)))) => {
            panic!("expected silence, received: {text}");
        }
        Ok(other) => panic!("expected silence, stream yielded: {other:?}"),
    }
}

pub async fn join(
    ws: &mut WsClient,
    conversation_id: i64,
    role: &str,
    store_id: Option<&str>,
) -> Value {
    let mut payload = json!({
        "type": "join",
        "conversation_id": conversation_id,
        "role": role,
    });
    if let Some(store) = store_id {
        payload["store_id"] = json!(store);
    }
    send_json(ws, payload).await;
    let ack = recv_json(ws).await;
    assert_eq!(ack["type"], "joined", "unexpected join response: {ack}");
    ack
}
