//! Transport abstraction for the telemetry feed
//!
//! The connection manager is transport-agnostic: anything that can open a
//! logical pub/sub connection and hand back a sink/stream pair will do.
//! Production uses the WebSocket bridge ([`crate::feed::ws`]); tests and
//! embeddings use the in-process loopback ([`crate::feed::memory`]).

use async_trait::async_trait;

use crate::error::Result;

/// One inbound message: the topic it was published on and the wire text of
/// its payload. Payloads are opaque at this layer; the manager parses them
/// before dispatch.
#[derive(Debug, Clone)]
pub struct Frame {
    pub topic: String,
    pub payload: String,
}

/// Factory for logical feed connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `url`, returning the write and read halves.
    ///
    /// Implementations should fail fast; the caller applies its own
    /// connect timeout on top.
    async fn connect(&self, url: &str) -> Result<(Box<dyn FeedSink>, Box<dyn FeedStream>)>;
}

/// Write half of a feed connection.
#[async_trait]
pub trait FeedSink: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<()>;
    async fn unsubscribe(&mut self, topic: &str) -> Result<()>;
    async fn publish(&mut self, topic: &str, payload: &str) -> Result<()>;
}

/// Read half of a feed connection.
#[async_trait]
pub trait FeedStream: Send {
    /// Next inbound frame; `None` once the connection is closed.
    async fn next_frame(&mut self) -> Option<Frame>;
}
