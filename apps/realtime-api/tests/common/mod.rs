use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::time;
use tokio_tungstenite::tungstenite;

use realtime_api::capabilities::StaticCapabilities;
use realtime_api::chat::registry::{MemoryRegistry, SubscriptionRegistry};
use realtime_api::config::Config;
use realtime_api::error::RegistryError;
use realtime_api::store::MemoryStore;
use realtime_api::AppState;

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestHarness {
    pub addr: SocketAddr,
    pub state: AppState,
    pub registry: Arc<dyn SubscriptionRegistry>,
    pub capabilities: Arc<StaticCapabilities>,
    pub store: Arc<MemoryStore>,
}

/// Registry whose fan-out lookups can be paused, holding a distributor
/// mid-cycle the way a slow shared backend would. Lets a test back up a
/// distribution queue deterministically.
pub struct PausableRegistry {
    inner: MemoryRegistry,
    gate: watch::Sender<bool>,
    lookups: watch::Sender<u64>,
}

impl PausableRegistry {
    pub fn new() -> Self {
        Self {
            inner: MemoryRegistry::new(),
            gate: watch::channel(false).0,
            lookups: watch::channel(0).0,
        }
    }

    pub fn pause(&self) {
        self.gate.send_replace(true);
    }

    pub fn resume(&self) {
        self.gate.send_replace(false);
    }

    /// Wait until at least `n` fan-out lookups have started. A started lookup
    /// means the distributor has dequeued an event and is parked behind the
    /// pause gate.
    pub async fn wait_for_lookups(&self, n: u64) {
        let mut rx = self.lookups.subscribe();
        while *rx.borrow_and_update() < n {
            rx.changed().await.expect("registry gone");
        }
    }
}

#[async_trait]
impl SubscriptionRegistry for PausableRegistry {
    async fn subscribe(
        &self,
        chat_id: &str,
        session_id: &str,
        principal_id: &str,
    ) -> Result<(), RegistryError> {
        self.inner.subscribe(chat_id, session_id, principal_id).await
    }

    async fn unsubscribe(&self, chat_id: &str, session_id: &str) -> Result<(), RegistryError> {
        self.inner.unsubscribe(chat_id, session_id).await
    }

    async fn sessions_for(&self, chat_id: &str) -> Result<Vec<String>, RegistryError> {
        self.lookups.send_modify(|n| *n += 1);
        let mut gate = self.gate.subscribe();
        gate.wait_for(|paused| !*paused).await.expect("registry gone");
        self.inner.sessions_for(chat_id).await
    }

    async fn drop_session(&self, session_id: &str) -> Result<(), RegistryError> {
        self.inner.drop_session(session_id).await
    }
}

/// Start an actual TCP server for WebSocket testing. Uses the minimum
/// write-back interval so persistence tests finish quickly.
pub async fn start_server() -> TestHarness {
    start_server_with_config(Config {
        message_writeback_interval_ms: 500,
        reaction_writeback_interval_ms: 500,
        ..Config::default()
    })
    .await
}

pub async fn start_server_with_config(config: Config) -> TestHarness {
    start_server_with_registry(config, Arc::new(MemoryRegistry::new())).await
}

pub async fn start_server_with_registry(
    config: Config,
    registry: Arc<dyn SubscriptionRegistry>,
) -> TestHarness {
    let capabilities = Arc::new(StaticCapabilities::new());
    let store = Arc::new(MemoryStore::new());

    let state = AppState::new(
        config,
        registry.clone(),
        capabilities.clone(),
        store.clone(),
        store.clone(),
    );

    let app = realtime_api::routes::router().with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestHarness {
        addr,
        state,
        registry,
        capabilities,
        store,
    }
}

/// Connect to the chat WebSocket and IDENTIFY as the given principal.
/// Returns the stream after receiving READY.
pub async fn connect_and_identify(addr: SocketAddr, principal_id: &str) -> WsStream {
    let url = format!("ws://{addr}/chat");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");

    send_op(&mut ws, 2, serde_json::json!({ "principal_id": principal_id })).await;

    let ready = recv_dispatch(&mut ws, "READY").await;
    assert!(ready["session_id"].as_str().unwrap().starts_with("ses_"));

    ws
}

/// Send a `{op, d}` frame.
pub async fn send_op(ws: &mut WsStream, op: u8, d: serde_json::Value) {
    let frame = serde_json::json!({ "op": op, "d": d });
    ws.send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .expect("ws send");
}

/// Read frames until a DISPATCH with the expected event name arrives, and
/// return its data. Panics after 5 seconds.
pub async fn recv_dispatch(ws: &mut WsStream, event_name: &str) -> serde_json::Value {
    let deadline = Duration::from_secs(5);
    time::timeout(deadline, async {
        loop {
            let msg = ws
                .next()
                .await
                .expect("stream ended")
                .expect("ws read error");
            let text = match msg.into_text() {
                Ok(t) => t,
                Err(_) => continue,
            };
            let frame: serde_json::Value = serde_json::from_str(&text).expect("parse frame");
            if frame["op"] == 0 && frame["t"] == event_name {
                return frame["d"].clone();
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {event_name}"))
}

/// Assert that no frame at all arrives within the window.
pub async fn assert_silent(ws: &mut WsStream, window: Duration) {
    let got = time::timeout(window, ws.next()).await;
    if let Ok(Some(Ok(msg))) = got {
        panic!("expected silence, received: {msg:?}");
    }
}

/// Subscribe to a chat and wait for the acknowledgement.
pub async fn subscribe(ws: &mut WsStream, chat_id: &str) {
    send_op(ws, 3, serde_json::json!({ "chat_id": chat_id })).await;
    let d = recv_dispatch(ws, "CHAT_SUBSCRIBED").await;
    assert_eq!(d["chat_id"], chat_id);
}

/// Send a chat message.
pub async fn send_message(ws: &mut WsStream, chat_id: &str, text: &str) {
    send_op(ws, 5, serde_json::json!({ "chat_id": chat_id, "text": text })).await;
}
