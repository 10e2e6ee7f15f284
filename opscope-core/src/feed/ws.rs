//! WebSocket bridge transport
//!
//! Speaks a small JSON envelope to a WebSocket-capable broker bridge:
//! outbound control frames are `{"op": "subscribe" | "unsubscribe" |
//! "publish", "topic": ..., "payload": ...}`, inbound messages arrive as
//! `{"topic": ..., "payload": "<wire text>"}`. Payloads stay opaque text
//! here; the connection manager parses them.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::transport::{FeedSink, FeedStream, Frame, Transport};

type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// WebSocket transport with a stable per-process client id.
pub struct WsTransport {
    client_id: String,
}

impl WsTransport {
    pub fn new() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            client_id: format!("opscope_{}", &suffix[..12]),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FeedSink>, Box<dyn FeedStream>)> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| Error::Connection(format!("websocket connect failed: {}", e)))?;
        let (write, read) = ws.split();

        let mut sink = WsSink { write };
        sink.send_op(json!({ "op": "hello", "client_id": self.client_id }))
            .await?;

        Ok((Box::new(sink), Box::new(WsStream { read })))
    }
}

struct WsSink {
    write: WsWrite,
}

impl WsSink {
    async fn send_op(&mut self, op: serde_json::Value) -> Result<()> {
        self.write
            .send(Message::Text(op.to_string()))
            .await
            .map_err(|e| Error::Connection(format!("websocket send failed: {}", e)))
    }
}

#[async_trait]
impl FeedSink for WsSink {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.send_op(json!({ "op": "subscribe", "topic": topic }))
            .await
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        self.send_op(json!({ "op": "unsubscribe", "topic": topic }))
            .await
    }

    async fn publish(&mut self, topic: &str, payload: &str) -> Result<()> {
        self.send_op(json!({ "op": "publish", "topic": topic, "payload": payload }))
            .await
    }
}

struct WsStream {
    read: WsRead,
}

#[async_trait]
impl FeedStream for WsStream {
    async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(frame) = parse_frame(&text) {
                        return Some(frame);
                    }
                    tracing::warn!("Skipping malformed bridge frame");
                }
                Some(Ok(Message::Close(_))) | None => return None,
                // Pings and pongs are handled by tungstenite; binary
                // frames are not part of the bridge protocol.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "WebSocket read error");
                    return None;
                }
            }
        }
    }
}

/// Decode one bridge envelope. The payload may be a string (opaque wire
/// text) or inline JSON, which is re-serialized to text.
fn parse_frame(text: &str) -> Option<Frame> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let topic = value.get("topic")?.as_str()?.to_string();
    let payload = match value.get("payload")? {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(Frame { topic, payload })
}
