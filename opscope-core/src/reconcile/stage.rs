//! Stage reconciliation
//!
//! Converts stage-transition messages into timeline events with duplicate
//! suppression, and stage-status messages into a per-stage status
//! projection. The dedup invariant: no two consecutive accepted
//! transitions may carry the same stage name, no matter how many duplicate
//! messages arrive.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ingest::{StageStatus, StageTransition};
use crate::types::{clean_stage_name, stage_color, EventKind, EventSource, TimelineEvent};

/// Latest status reported for one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageStatusEntry {
    /// Provider-defined status string, used verbatim
    pub status: String,
    pub last_update: DateTime<Utc>,
    pub active_tool: Option<String>,
}

/// Presentation-facing stage projection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageProgress {
    /// Last stage name accepted
    pub current_stage: Option<String>,
    /// Human-formatted form of `current_stage`
    pub clean_stage_name: Option<String>,
    /// Dedup key: the most recently accepted transition's raw name
    pub last_processed_stage: Option<String>,
    /// Per-stage status, fed by status messages independently of transitions
    pub stage_status: HashMap<String, StageStatusEntry>,
    pub last_update: Option<DateTime<Utc>>,
}

/// Maintains the stage projection and emits `stage_begin` events.
#[derive(Debug)]
pub struct StageReconciler {
    progress: StageProgress,
    reset_on_reconnect: bool,
}

impl StageReconciler {
    /// `reset_on_reconnect` controls whether the dedup key is cleared when
    /// the feed connection is (re)established. Clearing means the stage
    /// announced just before a disconnect is re-accepted as new after
    /// reconnect, even if the procedure never left it.
    pub fn new(reset_on_reconnect: bool) -> Self {
        Self {
            progress: StageProgress::default(),
            reset_on_reconnect,
        }
    }

    /// Apply a stage-transition message.
    ///
    /// Returns the `stage_begin` event, or `None` when the message repeats
    /// the last accepted stage.
    pub fn on_transition(
        &mut self,
        msg: &StageTransition,
        operation_id: Option<&str>,
    ) -> Option<TimelineEvent> {
        if self.progress.last_processed_stage.as_deref() == Some(msg.stage.as_str()) {
            tracing::debug!(stage = %msg.stage, "Ignoring duplicate stage transition");
            return None;
        }

        let clean = clean_stage_name(&msg.stage);
        tracing::info!(
            from = self.progress.last_processed_stage.as_deref().unwrap_or("none"),
            to = %msg.stage,
            "New stage accepted"
        );

        self.progress.last_processed_stage = Some(msg.stage.clone());
        self.progress.current_stage = Some(msg.stage.clone());
        self.progress.clean_stage_name = Some(clean.clone());
        self.progress.last_update = Some(msg.begin);

        let mut event = TimelineEvent::new(
            EventKind::StageBegin,
            format!("Started: {}", clean),
            msg.begin,
            EventSource::Feed,
        );
        event.operation_id = operation_id.map(str::to_string);
        event.confidence = msg.confidence;
        event.stage = Some(msg.stage.clone());
        event.stage_color = Some(stage_color(&msg.stage).to_string());
        event.data = msg.raw.clone();

        Some(event)
    }

    /// Apply a stage-status message.
    ///
    /// Updates the projection unconditionally — status is a live gauge, not
    /// a discrete occurrence — and never consults or mutates the dedup key.
    /// No timeline event is emitted.
    pub fn on_status(&mut self, msg: &StageStatus) {
        self.progress.current_stage = Some(msg.stage.clone());
        self.progress.clean_stage_name = Some(clean_stage_name(&msg.stage));
        self.progress.last_update = Some(msg.datetime);
        self.progress.stage_status.insert(
            msg.stage.clone(),
            StageStatusEntry {
                status: msg.status.clone(),
                last_update: msg.datetime,
                active_tool: msg.tool.clone(),
            },
        );
    }

    /// Called when the feed connection transitions to connected.
    ///
    /// Clears the dedup key if configured, so the first stage announced on
    /// a fresh connection is never mistaken for a duplicate of
    /// pre-disconnect state.
    pub fn on_connected(&mut self) {
        if self.reset_on_reconnect {
            self.progress.last_processed_stage = None;
        }
    }

    /// Clear all stage state (procedure unloaded).
    pub fn reset(&mut self) {
        self.progress = StageProgress::default();
    }

    pub fn progress(&self) -> &StageProgress {
        &self.progress
    }

    pub fn last_processed_stage(&self) -> Option<&str> {
        self.progress.last_processed_stage.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn transition(stage: &str, begin: &str) -> StageTransition {
        StageTransition {
            stage: stage.to_string(),
            begin: begin.parse::<DateTime<Utc>>().unwrap(),
            confidence: None,
            raw: json!({ "stage": stage, "begin": begin }),
        }
    }

    fn status(stage: &str, status_str: &str) -> StageStatus {
        StageStatus {
            stage: stage.to_string(),
            status: status_str.to_string(),
            datetime: Utc.with_ymd_and_hms(2024, 5, 14, 10, 0, 0).unwrap(),
            tool: Some("Hook".to_string()),
            raw: json!({ "stage": stage, "status": status_str }),
        }
    }

    #[test]
    fn test_duplicate_run_emits_once_with_first_timestamp() {
        let mut reconciler = StageReconciler::new(true);

        let first = reconciler
            .on_transition(&transition("Preparation", "2024-05-14T09:00:00Z"), None)
            .expect("first transition accepted");
        assert_eq!(first.kind, EventKind::StageBegin);
        assert_eq!(first.description, "Started: Preparation");
        assert_eq!(first.timestamp, "2024-05-14T09:00:00Z".parse::<DateTime<Utc>>().unwrap());

        // Duplicates of the same stage, later timestamps: all suppressed.
        assert!(reconciler
            .on_transition(&transition("Preparation", "2024-05-14T09:00:05Z"), None)
            .is_none());
        assert!(reconciler
            .on_transition(&transition("Preparation", "2024-05-14T09:00:10Z"), None)
            .is_none());

        // A different stage is accepted again.
        let next = reconciler
            .on_transition(
                &transition("CalotTriangleDissection", "2024-05-14T09:12:00Z"),
                None,
            )
            .expect("new stage accepted");
        assert_eq!(next.description, "Started: Calot Triangle Dissection");
        assert_eq!(next.stage_color.as_deref(), Some("emerald"));
    }

    #[test]
    fn test_transition_updates_projection() {
        let mut reconciler = StageReconciler::new(true);
        reconciler
            .on_transition(
                &transition("GallbladderDissection", "2024-05-14T09:40:00Z"),
                Some("op-17"),
            )
            .unwrap();

        let progress = reconciler.progress();
        assert_eq!(progress.current_stage.as_deref(), Some("GallbladderDissection"));
        assert_eq!(
            progress.clean_stage_name.as_deref(),
            Some("Gallbladder Dissection")
        );
        assert_eq!(progress.last_processed_stage.as_deref(), Some("GallbladderDissection"));
    }

    #[test]
    fn test_status_does_not_touch_dedup_key() {
        let mut reconciler = StageReconciler::new(true);
        reconciler
            .on_transition(&transition("Preparation", "2024-05-14T09:00:00Z"), None)
            .unwrap();

        // A status update for the same stage must not re-open the dedup gate.
        reconciler.on_status(&status("Preparation", "green"));
        assert!(reconciler
            .on_transition(&transition("Preparation", "2024-05-14T09:01:00Z"), None)
            .is_none());

        let entry = &reconciler.progress().stage_status["Preparation"];
        assert_eq!(entry.status, "green");
        assert_eq!(entry.active_tool.as_deref(), Some("Hook"));
    }

    #[test]
    fn test_status_updates_current_stage() {
        let mut reconciler = StageReconciler::new(true);
        reconciler.on_status(&status("ClippingCutting", "red"));

        let progress = reconciler.progress();
        assert_eq!(progress.current_stage.as_deref(), Some("ClippingCutting"));
        assert_eq!(progress.clean_stage_name.as_deref(), Some("Clipping Cutting"));
        assert!(progress.last_processed_stage.is_none());
    }

    #[test]
    fn test_reconnect_reset_reopens_dedup_gate() {
        let mut reconciler = StageReconciler::new(true);
        reconciler
            .on_transition(&transition("Preparation", "2024-05-14T09:00:00Z"), None)
            .unwrap();

        reconciler.on_connected();
        assert!(reconciler
            .on_transition(&transition("Preparation", "2024-05-14T09:02:00Z"), None)
            .is_some());
    }

    #[test]
    fn test_reconnect_reset_disabled_keeps_suppressing() {
        let mut reconciler = StageReconciler::new(false);
        reconciler
            .on_transition(&transition("Preparation", "2024-05-14T09:00:00Z"), None)
            .unwrap();

        reconciler.on_connected();
        assert!(reconciler
            .on_transition(&transition("Preparation", "2024-05-14T09:02:00Z"), None)
            .is_none());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut reconciler = StageReconciler::new(true);
        reconciler
            .on_transition(&transition("Preparation", "2024-05-14T09:00:00Z"), None)
            .unwrap();
        reconciler.on_status(&status("Preparation", "green"));

        reconciler.reset();
        let progress = reconciler.progress();
        assert!(progress.current_stage.is_none());
        assert!(progress.last_processed_stage.is_none());
        assert!(progress.stage_status.is_empty());
    }

    #[test]
    fn test_event_carries_color_and_raw_payload() {
        let mut reconciler = StageReconciler::new(true);
        let msg = transition("Preparation", "2024-05-14T09:00:00Z");
        let event = reconciler.on_transition(&msg, Some("op-3")).unwrap();

        assert_eq!(event.operation_id.as_deref(), Some("op-3"));
        assert_eq!(event.stage.as_deref(), Some("Preparation"));
        assert_eq!(event.stage_color.as_deref(), Some("blue"));
        assert_eq!(event.data, msg.raw);
    }
}
