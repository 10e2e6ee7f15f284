//! In-process loopback transport
//!
//! A channel-backed broker stand-in. The [`MemoryBroker`] handle is the
//! "server side": it injects frames, drops connections, and scripts
//! connection refusals, while observing subscriptions and published
//! frames. Used by the integration tests and useful for embedding the
//! monitor without a real broker.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

use super::transport::{FeedSink, FeedStream, Frame, Transport};

#[derive(Default)]
struct BrokerShared {
    /// Scripted outcomes for upcoming connect calls; empty queue = accept
    refusals: Mutex<VecDeque<()>>,
    connect_attempts: AtomicUsize,
    subscriptions: Mutex<HashSet<String>>,
    /// Frame sender of the live connection, if any
    frame_tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    published: Mutex<Vec<Frame>>,
}

/// Loopback transport half handed to the connection manager.
pub struct MemoryTransport {
    shared: Arc<BrokerShared>,
}

/// Broker-side control handle.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<BrokerShared>,
}

impl MemoryTransport {
    /// Create a transport plus its broker-side control handle.
    pub fn new() -> (Self, MemoryBroker) {
        let shared = Arc::new(BrokerShared::default());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MemoryBroker { shared },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, _url: &str) -> Result<(Box<dyn FeedSink>, Box<dyn FeedStream>)> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if self.shared.refusals.lock().pop_front().is_some() {
            return Err(Error::Connection("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.frame_tx.lock() = Some(tx);
        self.shared.subscriptions.lock().clear();

        Ok((
            Box::new(MemorySink {
                shared: Arc::clone(&self.shared),
            }),
            Box::new(MemoryStream { rx }),
        ))
    }
}

impl MemoryBroker {
    /// Deliver a frame to the live connection; dropped if none exists or
    /// the topic has no broker-level subscription.
    pub fn inject(&self, topic: &str, payload: &str) {
        if !self.is_subscribed(topic) {
            return;
        }
        if let Some(tx) = self.shared.frame_tx.lock().as_ref() {
            let _ = tx.send(Frame {
                topic: topic.to_string(),
                payload: payload.to_string(),
            });
        }
    }

    /// Close the live connection from the broker side.
    pub fn drop_connection(&self) {
        self.shared.frame_tx.lock().take();
    }

    /// Refuse the next `n` connect calls.
    pub fn refuse_next(&self, n: usize) {
        let mut refusals = self.shared.refusals.lock();
        for _ in 0..n {
            refusals.push_back(());
        }
    }

    /// Total connect calls seen, accepted or refused.
    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.shared.subscriptions.lock().contains(topic)
    }

    /// Frames published by the client side.
    pub fn published(&self) -> Vec<Frame> {
        self.shared.published.lock().clone()
    }
}

struct MemorySink {
    shared: Arc<BrokerShared>,
}

#[async_trait]
impl FeedSink for MemorySink {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.shared.subscriptions.lock().insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        self.shared.subscriptions.lock().remove(topic);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &str) -> Result<()> {
        self.shared.published.lock().push(Frame {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FeedStream for MemoryStream {
    async fn next_frame(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}
