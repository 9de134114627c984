use anyhow::Result;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::auth::BybitAuth;
use super::types::{WsMessage, WsOpResponse};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type MessageHandler = Arc<dyn Fn(&WsMessage) -> Result<()> + Send + Sync>;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(20);
/// Bybit accepts at most 10 topics per subscribe request.
const TOPICS_PER_REQUEST: usize = 10;

fn op_message(op: &str, args: &[String]) -> Message {
    Message::Text(serde_json::json!({ "op": op, "args": args }).to_string())
}

/// Reconnecting Bybit stream whose topics can change while it runs.
///
/// Handlers are invoked on the reader task in arrival order, so a handler
/// must only hand the payload off (e.g. into a channel).
pub struct BybitWebSocket {
    url: String,
    auth: Option<BybitAuth>,
    handlers: DashMap<String, MessageHandler>,
    /// Sender into the live connection's writer, `None` while disconnected.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    shutdown: CancellationToken,
}

impl BybitWebSocket {
    pub fn new(url: String) -> Self {
        Self {
            url,
            auth: None,
            handlers: DashMap::new(),
            outbound: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Private stream: every connection authenticates before subscribing.
    pub fn with_auth(url: String, auth: BybitAuth) -> Self {
        Self {
            auth: Some(auth),
            ..Self::new(url)
        }
    }

    pub fn subscribe(&self, topic: String, handler: MessageHandler) {
        let outbound = self.outbound.lock();
        if self.handlers.insert(topic.clone(), handler).is_some() {
            return;
        }
        info!("Subscribing to topic: {}", topic);
        if let Some(tx) = outbound.as_ref() {
            let _ = tx.send(op_message("subscribe", &[topic]));
        }
    }

    pub fn unsubscribe(&self, topic: &str) {
        let outbound = self.outbound.lock();
        if self.handlers.remove(topic).is_none() {
            return;
        }
        info!("Unsubscribing from topic: {}", topic);
        if let Some(tx) = outbound.as_ref() {
            let _ = tx.send(op_message("unsubscribe", &[topic.to_string()]));
        }
    }

    pub fn topics(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.lock().is_some()
    }

    /// Stop `run` and drop the connection.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub async fn connect(&self) -> Result<WsStream> {
        info!("Connecting to Bybit WebSocket: {}", self.url);

        let (ws_stream, response) = connect_async(&self.url).await?;

        info!("WebSocket connected: {:?}", response.status());

        Ok(ws_stream)
    }

    pub async fn run(self: Arc<Self>) {
        while !self.shutdown.is_cancelled() {
            match self.connect().await {
                Ok(ws_stream) => {
                    if let Err(e) = self.handle_stream(ws_stream).await {
                        error!("WebSocket error: {}", e);
                    }
                }
                Err(e) => error!("Connection failed: {}", e),
            }

            if self.shutdown.is_cancelled() {
                break;
            }
            warn!("Reconnecting in {}s...", RECONNECT_DELAY.as_secs());
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
        info!("WebSocket {} stopped", self.url);
    }

    async fn handle_stream(&self, ws_stream: WsStream) -> Result<()> {
        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Writer task: queued ops plus keep-alive
        let writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval(PING_INTERVAL);
            loop {
                let msg = tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = ping.tick() => Message::Text(r#"{"op":"ping"}"#.to_string()),
                };
                if let Err(e) = write.send(msg).await {
                    warn!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        if let Some(auth) = &self.auth {
            let (api_key, expires, signature) = auth.generate_ws_auth();
            let _ = tx.send(op_message("auth", &[api_key, expires, signature]));
        }

        {
            // Handlers added from here on send their own subscribe
            let mut outbound = self.outbound.lock();
            let topics = self.topics();
            for chunk in topics.chunks(TOPICS_PER_REQUEST) {
                let _ = tx.send(op_message("subscribe", chunk));
            }
            if !topics.is_empty() {
                info!("Resubscribed {} topics", topics.len());
            }
            *outbound = Some(tx);
        }

        let result = loop {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                msg = read.next() => msg,
            };

            match msg {
                Some(Ok(Message::Text(text))) => self.route_message(&text),
                Some(Ok(Message::Pong(_))) => debug!("Pong received"),
                Some(Ok(Message::Close(_))) => {
                    warn!("WebSocket closed by server");
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            }
        };

        *self.outbound.lock() = None;
        writer.abort();
        result
    }

    fn route_message(&self, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to parse message: {}", e);
                return;
            }
        };

        if value.get("op").is_some() {
            if let Ok(response) = serde_json::from_value::<WsOpResponse>(value) {
                match (response.op.as_str(), response.success) {
                    ("pong", _) | ("ping", _) => debug!("Pong received"),
                    ("auth", Some(true)) => info!("🔐 WebSocket authenticated"),
                    (op, Some(false)) => warn!("WebSocket {} rejected: {}", op, response.ret_msg),
                    (op, _) => debug!("WebSocket {} acknowledged", op),
                }
            }
            return;
        }

        let msg: WsMessage = match serde_json::from_value(value) {
            Ok(msg) => msg,
            Err(e) => {
                error!("Unexpected message shape: {}", e);
                return;
            }
        };
        let Some(topic) = msg.topic.as_deref() else {
            return;
        };

        let handler = self.handlers.get(topic).map(|entry| entry.value().clone());
        if let Some(handler) = handler {
            if let Err(e) = handler(&msg) {
                error!("Handler error on {}: {}", topic, e);
            }
        }
    }
}
