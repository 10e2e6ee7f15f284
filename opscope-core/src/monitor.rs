//! Procedure monitor
//!
//! The root object the presentation layer talks to. It owns the feed
//! connection, the reconcilers, the timeline, and the analysis session
//! controller, and exposes read-only projections of all of them.
//!
//! ```text
//! ┌──────────┐    ┌────────────┐    ┌─────────────────┐    ┌──────────┐
//! │   Feed   │ ──►│ classify() │ ──►│  Reconcilers    │ ──►│ Timeline │
//! │ (broker) │    │            │    │ (stage / tool)  │    │  + state │
//! └──────────┘    └────────────┘    └─────────────────┘    └──────────┘
//!        ▲                                                       │
//!        └── AnalysisSessionController (job start/stop) ◄────────┘
//! ```
//!
//! Every monitor is an isolated instance: no process-wide state, so
//! multiple procedures (or tests) can run side by side.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::analysis::{AnalysisKind, AnalysisSession, AnalysisStatus, SessionController, StopOutcome};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::feed::{ConnectionManager, FeedNotice, FeedStatus, HandlerId, MessageHandler, Transport, WsTransport};
use crate::ingest::{classify, Classification, Topic};
use crate::reconcile::{DetectedTools, StageProgress, StageReconciler, ToolReconciler};
use crate::timeline::TimelineStore;
use crate::types::{EventKind, EventSource, Procedure, TimelineEvent};

struct MonitorState {
    procedure: Option<Procedure>,
    timeline: TimelineStore,
    stages: StageReconciler,
    tools: ToolReconciler,
}

/// Owns one procedure's telemetry pipeline.
pub struct ProcedureMonitor {
    feed: ConnectionManager,
    controller: Option<SessionController>,
    state: Arc<Mutex<MonitorState>>,
    /// Active feed subscriptions, torn down on detach
    attached: Mutex<Vec<(String, HandlerId)>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ProcedureMonitor {
    /// Create a monitor using the WebSocket transport.
    pub fn new(config: Config) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(WsTransport::new());
        Self::with_transport(config, transport)
    }

    /// Create a monitor with an injected transport (tests, embeddings).
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let controller = SessionController::new(&config.analysis)?;
        let state = MonitorState {
            procedure: None,
            timeline: TimelineStore::with_capacity(config.timeline.capacity),
            stages: StageReconciler::new(config.feed.reset_stage_dedup_on_reconnect),
            tools: ToolReconciler::new(),
        };

        Ok(Self {
            feed: ConnectionManager::new(transport, config.feed),
            controller,
            state: Arc::new(Mutex::new(state)),
            attached: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        })
    }

    // ============================================
    // Procedure lifecycle
    // ============================================

    /// Load a procedure, clearing any previous timeline and projections.
    pub fn load_procedure(&self, procedure: Procedure) {
        tracing::info!(operation_id = %procedure.id, "Loading procedure");
        let mut state = self.state.lock();
        state.procedure = Some(procedure);
        state.timeline.clear();
        state.stages.reset();
        state.tools.reset();
    }

    /// Unload the current procedure.
    ///
    /// Tears down feed subscriptions and the connection synchronously and
    /// stops any open analysis session, so nothing can leak into the next
    /// procedure's view.
    pub fn clear_procedure(&self) {
        self.detach_feed();
        if let Some(controller) = &self.controller {
            controller.stop();
        }

        let mut state = self.state.lock();
        state.procedure = None;
        state.timeline.clear();
        state.stages.reset();
        state.tools.reset();
    }

    // ============================================
    // Analysis session
    // ============================================

    /// Start an analysis session for the loaded procedure and attach the
    /// feed topics its kind requires.
    pub async fn start_analysis(&self, kind: AnalysisKind) -> Result<AnalysisSession> {
        let controller = self
            .controller
            .as_ref()
            .ok_or_else(|| Error::Config("analysis service is not configured".to_string()))?;

        let (operation_id, video_id) = {
            let state = self.state.lock();
            let procedure = state
                .procedure
                .as_ref()
                .ok_or_else(|| Error::Config("no procedure loaded".to_string()))?;
            (procedure.id.clone(), procedure.video_id.clone())
        };

        let session = controller.start(kind, &operation_id, &video_id).await?;

        // Feed trouble must not undo a successfully started job; the
        // connection keeps self-healing in the background.
        if let Err(e) = self.attach_feed(kind).await {
            tracing::warn!(error = %e, "Analysis started but feed connection failed");
        }

        self.append_system_event(
            EventKind::AnalysisStarted,
            format!("Analysis started: {} (job {})", kind, session.job_id),
            json!({
                "job_id": session.job_id,
                "kind": kind.as_str(),
                "state": session.state,
            }),
        );

        Ok(session)
    }

    /// Stop the analysis session and detach the feed.
    ///
    /// Local-only, like [`SessionController::stop`]; the outcome tells the
    /// caller whether a session was actually cleared.
    pub fn stop_analysis(&self) -> StopOutcome {
        let outcome = match &self.controller {
            Some(controller) => controller.stop(),
            None => StopOutcome::NothingRunning,
        };

        self.detach_feed();

        if let StopOutcome::Stopped {
            session: Some(session),
        } = &outcome
        {
            self.append_system_event(
                EventKind::AnalysisStopped,
                format!(
                    "Analysis stopped locally (job {} may continue remotely)",
                    session.job_id
                ),
                json!({ "job_id": session.job_id, "kind": session.kind.as_str() }),
            );
        }

        outcome
    }

    // ============================================
    // Feed wiring
    // ============================================

    /// Connect the feed and subscribe the topics for `kind`.
    pub async fn attach_feed(&self, kind: AnalysisKind) -> Result<()> {
        self.feed.connect().await?;
        self.spawn_status_watcher();

        let mut attached = self.attached.lock();
        for topic in kind.topics() {
            if attached.iter().any(|(t, _)| t == topic) {
                continue;
            }
            let id = self.feed.subscribe(topic, self.make_handler());
            attached.push((topic.to_string(), id));
        }
        Ok(())
    }

    /// Unsubscribe all attached topics and disconnect.
    pub fn detach_feed(&self) {
        for (topic, id) in self.attached.lock().drain(..) {
            self.feed.unsubscribe(&topic, id);
        }
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
        self.feed.disconnect();
    }

    /// Handler shared by all topics: classify, reconcile, append.
    fn make_handler(&self) -> MessageHandler {
        let state = Arc::clone(&self.state);
        Arc::new(move |topic: &str, value: &serde_json::Value| {
            let Some(topic) = Topic::from_name(topic) else {
                return;
            };

            let classification = classify(topic, value);
            let mut state = state.lock();
            let operation_id = state.procedure.as_ref().map(|p| p.id.clone());

            match classification {
                Classification::StageTransition(msg) => {
                    if let Some(event) = state.stages.on_transition(&msg, operation_id.as_deref()) {
                        state.timeline.append(event);
                    }
                }
                Classification::StageStatus(msg) => state.stages.on_status(&msg),
                Classification::ToolInventory(inv) => {
                    let events = state.tools.on_inventory(&inv, operation_id.as_deref());
                    for event in events {
                        state.timeline.append(event);
                    }
                }
                Classification::Informational => {}
                Classification::Invalid { reason } => {
                    tracing::warn!(topic = %topic.name(), %reason, "Dropping invalid feed message");
                }
            }
        })
    }

    /// Reset the stage dedup key whenever the feed (re)connects, so stale
    /// pre-disconnect state never suppresses a fresh announcement.
    fn spawn_status_watcher(&self) {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return;
        }

        let mut notices = self.feed.notices();
        let state = Arc::clone(&self.state);
        *watcher = Some(tokio::spawn(async move {
            loop {
                match notices.recv().await {
                    Ok(FeedNotice::Connected) => state.lock().stages.on_connected(),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    // ============================================
    // Manual event injection
    // ============================================

    /// Append an externally built event (system annotations, operator notes).
    pub fn add_event(&self, event: TimelineEvent) {
        self.state.lock().timeline.append(event);
    }

    /// Record an operation status change as a system event.
    pub fn note_status_change(&self, status: &str) {
        self.append_system_event(
            EventKind::StatusNote,
            format!("Operation status changed to: {}", status),
            json!({ "status": status }),
        );
    }

    fn append_system_event(&self, kind: EventKind, description: String, data: serde_json::Value) {
        let mut state = self.state.lock();
        let mut event = TimelineEvent::new(kind, description, chrono::Utc::now(), EventSource::System);
        event.operation_id = state.procedure.as_ref().map(|p| p.id.clone());
        event.data = data;
        state.timeline.append(event);
    }

    // ============================================
    // Projections
    // ============================================

    /// Timeline snapshot, newest-first.
    pub fn events(&self) -> Vec<TimelineEvent> {
        self.state.lock().timeline.snapshot()
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().timeline.len()
    }

    pub fn stage_progress(&self) -> StageProgress {
        self.state.lock().stages.progress().clone()
    }

    pub fn detected_tools(&self) -> DetectedTools {
        self.state.lock().tools.detected().clone()
    }

    pub fn feed_status(&self) -> FeedStatus {
        self.feed.status()
    }

    pub fn is_feed_connected(&self) -> bool {
        self.feed.is_connected()
    }

    pub fn analysis_status(&self) -> AnalysisStatus {
        self.controller
            .as_ref()
            .map(|c| c.status())
            .unwrap_or(AnalysisStatus::Idle)
    }

    pub fn current_session(&self) -> Option<AnalysisSession> {
        self.controller.as_ref().and_then(|c| c.current_session())
    }

    pub fn current_procedure(&self) -> Option<Procedure> {
        self.state.lock().procedure.clone()
    }

    /// Direct access to the connection manager (publishing, notices).
    pub fn connection(&self) -> &ConnectionManager {
        &self.feed
    }
}

impl Drop for ProcedureMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryTransport;

    fn monitor() -> ProcedureMonitor {
        let (transport, _broker) = MemoryTransport::new();
        ProcedureMonitor::with_transport(Config::default(), Arc::new(transport)).unwrap()
    }

    #[test]
    fn test_load_procedure_clears_previous_state() {
        let monitor = monitor();
        monitor.load_procedure(Procedure::new("op-1", "video01"));
        monitor.note_status_change("in-progress");
        assert_eq!(monitor.event_count(), 1);

        monitor.load_procedure(Procedure::new("op-2", "video02"));
        assert_eq!(monitor.event_count(), 0);
        assert_eq!(monitor.current_procedure().unwrap().id, "op-2");
    }

    #[test]
    fn test_status_note_carries_operation_id() {
        let monitor = monitor();
        monitor.load_procedure(Procedure::new("op-9", "video09"));
        monitor.note_status_change("completed");

        let events = monitor.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::StatusNote);
        assert_eq!(events[0].source, EventSource::System);
        assert_eq!(events[0].operation_id.as_deref(), Some("op-9"));
        assert_eq!(events[0].description, "Operation status changed to: completed");
    }

    #[test]
    fn test_unconfigured_analysis_reports_idle() {
        let monitor = monitor();
        assert_eq!(monitor.analysis_status(), AnalysisStatus::Idle);
        assert!(monitor.current_session().is_none());
        assert!(!monitor.stop_analysis().stopped());
    }

    #[tokio::test]
    async fn test_start_analysis_requires_configuration() {
        let monitor = monitor();
        monitor.load_procedure(Procedure::new("op-1", "video01"));
        assert!(matches!(
            monitor.start_analysis(AnalysisKind::ToolDetection).await,
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_clear_procedure_resets_projections() {
        let monitor = monitor();
        monitor.load_procedure(Procedure::new("op-1", "video01"));
        monitor.note_status_change("in-progress");

        monitor.clear_procedure();
        assert!(monitor.current_procedure().is_none());
        assert_eq!(monitor.event_count(), 0);
        assert!(monitor.stage_progress().current_stage.is_none());
        assert!(monitor.detected_tools().is_empty());
        assert_eq!(monitor.feed_status(), FeedStatus::Disconnected);
    }
}
