//! Connection management for the telemetry feed
//!
//! One [`ConnectionManager`] owns one logical connection to the broker.
//! It multiplexes topic handlers over that connection, parses inbound wire
//! text into structured JSON before dispatch, and applies the reconnection
//! policy: bounded consecutive retries, then **quiet mode** — no further
//! attempts and a single terminal error notice until a cooldown (or an
//! explicit [`ConnectionManager::re_enable`]) re-arms it.
//!
//! All handler dispatch happens sequentially on the connection's driver
//! task, so handlers never observe two messages concurrently.

pub mod memory;
pub mod transport;
pub mod ws;

pub use memory::{MemoryBroker, MemoryTransport};
pub use transport::{FeedSink, FeedStream, Frame, Transport};
pub use ws::WsTransport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::FeedConfig;
use crate::error::{Error, Result};

/// Connection lifecycle state exposed to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnection disabled after repeated failures, pending re-enable
    Quiet,
}

impl FeedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedStatus::Disconnected => "disconnected",
            FeedStatus::Connecting => "connecting",
            FeedStatus::Connected => "connected",
            FeedStatus::Quiet => "quiet",
        }
    }
}

/// Lifecycle notices broadcast by the manager.
///
/// Transport errors never escalate past this channel; they only degrade
/// [`FeedStatus`].
#[derive(Debug, Clone)]
pub enum FeedNotice {
    Connected,
    Disconnected,
    ReconnectFailed { attempt: u32 },
    /// Terminal notice when entering quiet mode
    Quiet,
    Error(String),
}

/// A message handler: receives the topic and the parsed payload.
pub type MessageHandler = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

/// Identity of one registered handler, used to unsubscribe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, payload: String },
}

#[derive(Default)]
struct HandlerRegistry {
    by_topic: HashMap<String, Vec<(HandlerId, MessageHandler)>>,
}

impl HandlerRegistry {
    /// Returns true when this is the first handler for the topic.
    fn add(&mut self, topic: &str, id: HandlerId, handler: MessageHandler) -> bool {
        let handlers = self.by_topic.entry(topic.to_string()).or_default();
        handlers.push((id, handler));
        handlers.len() == 1
    }

    /// Returns true when the last handler for the topic was removed.
    fn remove(&mut self, topic: &str, id: HandlerId) -> bool {
        let Some(handlers) = self.by_topic.get_mut(topic) else {
            return false;
        };
        handlers.retain(|(hid, _)| *hid != id);
        if handlers.is_empty() {
            self.by_topic.remove(topic);
            true
        } else {
            false
        }
    }

    fn topics(&self) -> Vec<String> {
        self.by_topic.keys().cloned().collect()
    }

    fn handlers_for(&self, topic: &str) -> Vec<MessageHandler> {
        self.by_topic
            .get(topic)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: FeedConfig,
    status: Mutex<FeedStatus>,
    handlers: Mutex<HandlerRegistry>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    notice_tx: broadcast::Sender<FeedNotice>,
    next_handler_id: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.get_mut().take() {
            handle.abort();
        }
    }
}

/// Owns the single logical feed connection.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

enum PumpExit {
    ConnectionLost,
    Shutdown,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: FeedConfig) -> Self {
        let (notice_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                status: Mutex::new(FeedStatus::Disconnected),
                handlers: Mutex::new(HandlerRegistry::default()),
                cmd_tx: Mutex::new(None),
                driver: Mutex::new(None),
                notice_tx,
                next_handler_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn status(&self) -> FeedStatus {
        *self.inner.status.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == FeedStatus::Connected
    }

    /// Subscribe to lifecycle notices.
    pub fn notices(&self) -> broadcast::Receiver<FeedNotice> {
        self.inner.notice_tx.subscribe()
    }

    /// Establish the logical connection.
    ///
    /// Resolves immediately when already connected. Only this call's own
    /// attempt can return an error; failures during later automatic
    /// reconnection are reported as notices instead.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut status = self.inner.status.lock();
            match *status {
                FeedStatus::Connected | FeedStatus::Connecting => return Ok(()),
                FeedStatus::Quiet => {
                    return Err(Error::Connection(
                        "feed is in quiet mode; re-enable before reconnecting".to_string(),
                    ))
                }
                FeedStatus::Disconnected => *status = FeedStatus::Connecting,
            }
        }

        match Self::attempt_connect(&self.inner).await {
            Ok(halves) => {
                self.install(halves);
                Ok(())
            }
            Err(e) => {
                *self.inner.status.lock() = FeedStatus::Disconnected;
                Err(e)
            }
        }
    }

    /// Register a handler; the broker-level subscription is issued with the
    /// first handler for a topic.
    pub fn subscribe(&self, topic: &str, handler: MessageHandler) -> HandlerId {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let first = self.inner.handlers.lock().add(topic, id, handler);
        if first {
            self.send_command(Command::Subscribe(topic.to_string()));
        }
        id
    }

    /// Remove a handler; the broker-level subscription is released with the
    /// last handler for a topic.
    pub fn unsubscribe(&self, topic: &str, id: HandlerId) {
        let last = self.inner.handlers.lock().remove(topic, id);
        if last {
            self.send_command(Command::Unsubscribe(topic.to_string()));
        }
    }

    /// Publish a message; fails when not connected.
    pub fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Connection(
                "not connected, cannot publish".to_string(),
            ));
        }
        let payload = serde_json::to_string(payload)?;
        self.send_command(Command::Publish {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    /// Tear down the connection, cancel timers, and clear all handlers.
    pub fn disconnect(&self) {
        self.inner.cmd_tx.lock().take();
        if let Some(handle) = self.inner.driver.lock().take() {
            handle.abort();
        }
        self.inner.handlers.lock().by_topic.clear();
        *self.inner.status.lock() = FeedStatus::Disconnected;
        let _ = self.inner.notice_tx.send(FeedNotice::Disconnected);
    }

    /// Leave quiet mode manually. Returns true if the manager was quiet;
    /// the caller still needs to [`connect`](Self::connect) afterwards.
    pub fn re_enable(&self) -> bool {
        {
            let mut status = self.inner.status.lock();
            if *status != FeedStatus::Quiet {
                return false;
            }
            *status = FeedStatus::Disconnected;
        }
        self.inner.cmd_tx.lock().take();
        if let Some(handle) = self.inner.driver.lock().take() {
            handle.abort();
        }
        tracing::info!("Feed re-enabled after quiet mode");
        true
    }

    fn send_command(&self, cmd: Command) {
        if let Some(tx) = self.inner.cmd_tx.lock().as_ref() {
            let _ = tx.send(cmd);
        }
    }

    fn install(&self, halves: (Box<dyn FeedSink>, Box<dyn FeedStream>)) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *self.inner.cmd_tx.lock() = Some(cmd_tx);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(Self::drive(inner, halves, cmd_rx));
        if let Some(old) = self.inner.driver.lock().replace(handle) {
            old.abort();
        }

        *self.inner.status.lock() = FeedStatus::Connected;
        let _ = self.inner.notice_tx.send(FeedNotice::Connected);
        tracing::info!(broker = %self.inner.config.broker_url, "Feed connected");
    }

    async fn attempt_connect(inner: &Arc<Inner>) -> Result<(Box<dyn FeedSink>, Box<dyn FeedStream>)> {
        let timeout = Duration::from_secs(inner.config.connect_timeout_secs);
        match tokio::time::timeout(timeout, inner.transport.connect(&inner.config.broker_url)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Connection(format!(
                "connection attempt timed out after {}s",
                inner.config.connect_timeout_secs
            ))),
        }
    }

    /// Driver task: pumps one connection, reconnecting as needed.
    async fn drive(
        inner: Arc<Inner>,
        halves: (Box<dyn FeedSink>, Box<dyn FeedStream>),
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) {
        let (mut sink, mut stream) = halves;
        Self::sync_subscriptions(&inner, sink.as_mut()).await;

        loop {
            match Self::pump(&inner, sink.as_mut(), stream.as_mut(), &mut cmd_rx).await {
                PumpExit::Shutdown => return,
                PumpExit::ConnectionLost => {}
            }

            *inner.status.lock() = FeedStatus::Disconnected;
            let _ = inner.notice_tx.send(FeedNotice::Disconnected);
            tracing::warn!("Feed connection lost, attempting reconnection");

            match Self::reconnect(&inner).await {
                Some((new_sink, new_stream)) => {
                    sink = new_sink;
                    stream = new_stream;
                    *inner.status.lock() = FeedStatus::Connected;
                    let _ = inner.notice_tx.send(FeedNotice::Connected);
                    tracing::info!("Feed reconnected");
                    Self::sync_subscriptions(&inner, sink.as_mut()).await;
                }
                // Quiet without auto re-enable: the driver retires and an
                // explicit re_enable() + connect() is required.
                None => return,
            }
        }
    }

    async fn pump(
        inner: &Arc<Inner>,
        sink: &mut dyn FeedSink,
        stream: &mut dyn FeedStream,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> PumpExit {
        loop {
            tokio::select! {
                frame = stream.next_frame() => match frame {
                    Some(frame) => Self::dispatch(inner, &frame),
                    None => return PumpExit::ConnectionLost,
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Subscribe(topic)) => {
                        if let Err(e) = sink.subscribe(&topic).await {
                            tracing::warn!(topic = %topic, error = %e, "Subscribe failed");
                        } else {
                            tracing::debug!(topic = %topic, "Subscribed");
                        }
                    }
                    Some(Command::Unsubscribe(topic)) => {
                        if let Err(e) = sink.unsubscribe(&topic).await {
                            tracing::warn!(topic = %topic, error = %e, "Unsubscribe failed");
                        }
                    }
                    Some(Command::Publish { topic, payload }) => {
                        if let Err(e) = sink.publish(&topic, &payload).await {
                            tracing::warn!(topic = %topic, error = %e, "Publish failed");
                            let _ = inner
                                .notice_tx
                                .send(FeedNotice::Error(format!("publish to {} failed", topic)));
                        }
                    }
                    None => return PumpExit::Shutdown,
                },
            }
        }
    }

    /// Parse the wire payload and invoke the topic's handlers in
    /// registration order. Parse failures degrade to a notice.
    fn dispatch(inner: &Inner, frame: &Frame) {
        let value: serde_json::Value = match serde_json::from_str(&frame.payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(topic = %frame.topic, error = %e, "Dropping unparseable payload");
                let _ = inner.notice_tx.send(FeedNotice::Error(format!(
                    "failed to parse message on {}",
                    frame.topic
                )));
                return;
            }
        };

        let handlers = inner.handlers.lock().handlers_for(&frame.topic);
        for handler in handlers {
            handler(&frame.topic, &value);
        }
    }

    /// Issue broker-level subscriptions for every topic with handlers.
    async fn sync_subscriptions(inner: &Arc<Inner>, sink: &mut dyn FeedSink) {
        let topics = inner.handlers.lock().topics();
        for topic in topics {
            if let Err(e) = sink.subscribe(&topic).await {
                tracing::warn!(topic = %topic, error = %e, "Subscribe failed");
            }
        }
    }

    /// Bounded reconnection with quiet-mode backoff.
    ///
    /// Returns the new connection halves, or `None` when quiet mode was
    /// entered with auto re-enable disabled.
    async fn reconnect(inner: &Arc<Inner>) -> Option<(Box<dyn FeedSink>, Box<dyn FeedStream>)> {
        loop {
            for attempt in 1..=inner.config.max_reconnect_attempts {
                tokio::time::sleep(Duration::from_secs(inner.config.reconnect_delay_secs)).await;
                match Self::attempt_connect(inner).await {
                    Ok(halves) => return Some(halves),
                    Err(e) => {
                        tracing::debug!(attempt, error = %e, "Reconnect attempt failed");
                        let _ = inner.notice_tx.send(FeedNotice::ReconnectFailed { attempt });
                    }
                }
            }

            *inner.status.lock() = FeedStatus::Quiet;
            let _ = inner.notice_tx.send(FeedNotice::Error(format!(
                "reconnection disabled after {} consecutive failures",
                inner.config.max_reconnect_attempts
            )));
            let _ = inner.notice_tx.send(FeedNotice::Quiet);
            tracing::warn!(
                attempts = inner.config.max_reconnect_attempts,
                "Entering quiet mode"
            );

            if !inner.config.auto_reenable {
                return None;
            }

            tokio::time::sleep(Duration::from_secs(inner.config.quiet_cooldown_secs)).await;
            tracing::info!("Quiet cooldown elapsed, re-enabling reconnection");
            *inner.status.lock() = FeedStatus::Disconnected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> FeedConfig {
        FeedConfig {
            broker_url: "ws://test-broker:9001".to_string(),
            connect_timeout_secs: 2,
            reconnect_delay_secs: 1,
            max_reconnect_attempts: 3,
            quiet_cooldown_secs: 5,
            auto_reenable: false,
            reset_stage_dedup_on_reconnect: true,
        }
    }

    fn manager_with_broker(config: FeedConfig) -> (ConnectionManager, MemoryBroker) {
        let (transport, broker) = MemoryTransport::new();
        (ConnectionManager::new(Arc::new(transport), config), broker)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        // The paused clock auto-advances, so long waits cost no real time.
        for _ in 0..3000 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_subscribe_dispatch() {
        let (manager, broker) = manager_with_broker(test_config());
        manager.connect().await.unwrap();
        assert!(manager.is_connected());

        let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.subscribe(
            "surgery/tool",
            Arc::new(move |_topic: &str, value: &serde_json::Value| sink.lock().push(value.clone())),
        );

        assert!(wait_until(|| broker.is_subscribed("surgery/tool")).await);

        broker.inject("surgery/tool", r#"{"tool":["Grasper"]}"#);
        assert!(wait_until(|| !seen.lock().is_empty()).await);
        assert_eq!(seen.lock()[0], json!({"tool": ["Grasper"]}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent_while_connected() {
        let (manager, broker) = manager_with_broker(test_config());
        manager.connect().await.unwrap();
        manager.connect().await.unwrap();
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_connect_failure_rejects() {
        let (manager, broker) = manager_with_broker(test_config());
        broker.refuse_next(1);

        assert!(manager.connect().await.is_err());
        assert_eq!(manager.status(), FeedStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_requires_connection() {
        let (manager, broker) = manager_with_broker(test_config());
        assert!(manager.publish("surgery/tool", &json!({"x": 1})).is_err());

        manager.connect().await.unwrap();
        manager.publish("surgery/tool", &json!({"x": 1})).unwrap();
        assert!(wait_until(|| !broker.published().is_empty()).await);
        assert_eq!(broker.published()[0].topic, "surgery/tool");
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_mode_after_bounded_retries() {
        let (manager, broker) = manager_with_broker(test_config());
        manager.connect().await.unwrap();
        assert_eq!(broker.connect_attempts(), 1);

        broker.refuse_next(10);
        broker.drop_connection();

        assert!(wait_until(|| manager.status() == FeedStatus::Quiet).await);
        // 1 initial + 3 bounded retries, and no fourth retry afterwards.
        assert_eq!(broker.connect_attempts(), 4);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(broker.connect_attempts(), 4);
        assert_eq!(manager.status(), FeedStatus::Quiet);

        // connect() is refused until an explicit re-enable.
        assert!(manager.connect().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_cooldown_auto_reenables() {
        let config = FeedConfig {
            auto_reenable: true,
            ..test_config()
        };
        let (manager, broker) = manager_with_broker(config);
        manager.connect().await.unwrap();

        let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.subscribe(
            "surgery/stage",
            Arc::new(move |_topic: &str, value: &serde_json::Value| sink.lock().push(value.clone())),
        );
        assert!(wait_until(|| broker.is_subscribed("surgery/stage")).await);

        broker.refuse_next(3);
        broker.drop_connection();

        // Recovers through quiet mode and resubscribes its topics.
        assert!(wait_until(|| manager.status() == FeedStatus::Connected).await);
        assert_eq!(broker.connect_attempts(), 5);
        assert!(wait_until(|| broker.is_subscribed("surgery/stage")).await);

        broker.inject("surgery/stage", r#"{"stage":"Preparation","begin":"2024-05-14T09:00:00Z"}"#);
        assert!(wait_until(|| !seen.lock().is_empty()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_re_enable() {
        let (manager, broker) = manager_with_broker(test_config());
        manager.connect().await.unwrap();
        broker.refuse_next(3);
        broker.drop_connection();
        assert!(wait_until(|| manager.status() == FeedStatus::Quiet).await);

        assert!(manager.re_enable());
        assert!(!manager.re_enable());
        assert_eq!(manager.status(), FeedStatus::Disconnected);

        manager.connect().await.unwrap();
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_unsubscribe_releases_topic() {
        let (manager, broker) = manager_with_broker(test_config());
        manager.connect().await.unwrap();

        let noop: MessageHandler = Arc::new(|_, _| {});
        let first = manager.subscribe("surgery/status", Arc::clone(&noop));
        let second = manager.subscribe("surgery/status", noop);
        assert!(wait_until(|| broker.is_subscribed("surgery/status")).await);

        manager.unsubscribe("surgery/status", first);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker.is_subscribed("surgery/status"));

        manager.unsubscribe("surgery/status", second);
        assert!(wait_until(|| !broker.is_subscribed("surgery/status")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparseable_payload_is_dropped() {
        let (manager, broker) = manager_with_broker(test_config());
        manager.connect().await.unwrap();

        let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.subscribe(
            "surgery/tool",
            Arc::new(move |_topic: &str, value: &serde_json::Value| sink.lock().push(value.clone())),
        );
        assert!(wait_until(|| broker.is_subscribed("surgery/tool")).await);

        let mut notices = manager.notices();
        broker.inject("surgery/tool", "not json at all");

        assert!(wait_until(|| matches!(notices.try_recv(), Ok(FeedNotice::Error(_)))).await);
        assert!(seen.lock().is_empty());
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_clears_handlers_and_status() {
        let (manager, broker) = manager_with_broker(test_config());
        manager.connect().await.unwrap();
        manager.subscribe("surgery/tool", Arc::new(|_, _| {}));
        assert!(wait_until(|| broker.is_subscribed("surgery/tool")).await);

        manager.disconnect();
        assert_eq!(manager.status(), FeedStatus::Disconnected);
        assert!(manager.publish("surgery/tool", &json!({})).is_err());

        // A fresh connect starts with no handlers, so nothing resubscribes.
        manager.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!broker.is_subscribed("surgery/tool"));
    }
}
