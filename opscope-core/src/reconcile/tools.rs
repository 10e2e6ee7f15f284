//! Tool-inventory reconciliation
//!
//! Every accepted inventory message replaces the detected-tool set
//! wholesale. The reconciler computes the set difference against the
//! previous snapshot and emits:
//!
//! - per-change events (`tool_detected` / `tool_removed`) for small deltas,
//!   suppressed when a single message adds or removes more than two tools;
//! - exactly one workflow event classifying the transition shape by
//!   count (start / intense start / intensify / focus / pause / shift /
//!   switch), first match wins.
//!
//! An inventory identical to the current set — in any order — is a no-op:
//! nothing is emitted and nothing is updated.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::ingest::ToolInventory;
use crate::types::{EventKind, EventSource, TimelineEvent, Tool};

/// Per-change events are grouped away beyond this many adds or removes in
/// one message.
const GROUPED_EVENT_LIMIT: usize = 2;

/// Presentation-facing detected-tool projection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectedTools {
    /// Tools currently believed active, in arrival order
    pub tools: Vec<Tool>,
    /// Timestamp of the last accepted (non-no-op) inventory message
    pub last_update: Option<DateTime<Utc>>,
}

impl DetectedTools {
    pub fn contains(&self, tool: Tool) -> bool {
        self.tools.contains(&tool)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Maintains the detected-tool set and classifies inventory transitions.
#[derive(Debug, Default)]
pub struct ToolReconciler {
    state: DetectedTools,
}

impl ToolReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an inventory message, returning the events it produced.
    ///
    /// A message whose tool set equals the current one (order-insensitive)
    /// produces no events and leaves `last_update` untouched.
    pub fn on_inventory(
        &mut self,
        inv: &ToolInventory,
        operation_id: Option<&str>,
    ) -> Vec<TimelineEvent> {
        let prev = self.state.tools.clone();
        let added: Vec<Tool> = inv
            .tools
            .iter()
            .filter(|t| !prev.contains(t))
            .copied()
            .collect();
        let removed: Vec<Tool> = prev
            .iter()
            .filter(|t| !inv.tools.contains(t))
            .copied()
            .collect();

        if added.is_empty() && removed.is_empty() {
            tracing::debug!("No tool changes detected, skipping event creation");
            return Vec::new();
        }

        let timestamp = inv.timestamp.unwrap_or_else(Utc::now);
        self.state.tools = inv.tools.clone();
        self.state.last_update = Some(timestamp);

        tracing::info!(
            tools = %join(&inv.tools),
            added = added.len(),
            removed = removed.len(),
            "Tool inventory changed"
        );

        let mut events = Vec::new();

        if (1..=GROUPED_EVENT_LIMIT).contains(&added.len()) {
            let mut event = TimelineEvent::new(
                EventKind::ToolDetected,
                format!("Tool detected: {}", join(&added)),
                timestamp,
                EventSource::Feed,
            );
            event.data = json!({ "tools": names(&added), "action": "detected" });
            events.push(event);
        }

        if (1..=GROUPED_EVENT_LIMIT).contains(&removed.len()) {
            let mut event = TimelineEvent::new(
                EventKind::ToolRemoved,
                format!("Tool removed: {}", join(&removed)),
                timestamp,
                EventSource::Feed,
            );
            event.data = json!({ "tools": names(&removed), "action": "removed" });
            events.push(event);
        }

        if let Some(event) = classify_workflow(&prev, &inv.tools, timestamp) {
            events.push(event);
        }

        for event in &mut events {
            event.operation_id = operation_id.map(str::to_string);
            event.confidence = inv.confidence;
        }

        events
    }

    /// Current projection.
    pub fn detected(&self) -> &DetectedTools {
        &self.state
    }

    /// Clear all tool state (procedure unloaded).
    pub fn reset(&mut self) {
        self.state = DetectedTools::default();
    }
}

/// Classify the transition shape between two tool-set snapshots.
///
/// Evaluated in order, first match wins. Callers guarantee the sets differ;
/// the same-single-tool and empty-to-empty shapes are therefore
/// unreachable and fall out as `None`.
fn classify_workflow(
    prev: &[Tool],
    current: &[Tool],
    timestamp: DateTime<Utc>,
) -> Option<TimelineEvent> {
    let prev_count = prev.len();
    let count = current.len();

    let (kind, description, transition) = if prev_count == 0 && count == 1 {
        (
            EventKind::WorkflowStart,
            format!("Workflow started: {}", current[0]),
            "none_to_single",
        )
    } else if prev_count == 0 && count > 1 {
        (
            EventKind::WorkflowIntenseStart,
            format!("Workflow started with multiple tools: {}", join(current)),
            "none_to_multiple",
        )
    } else if prev_count == 1 && count > 1 {
        (
            EventKind::WorkflowIntensify,
            format!("Multiple tools active: {}", join(current)),
            "single_to_multiple",
        )
    } else if prev_count > 1 && count == 1 {
        (
            EventKind::WorkflowFocus,
            format!("Workflow focused on: {}", current[0]),
            "multiple_to_single",
        )
    } else if prev_count > 0 && count == 0 {
        (
            EventKind::WorkflowPause,
            "Workflow paused".to_string(),
            "active_to_none",
        )
    } else if prev_count > 1 && count > 1 {
        (
            EventKind::WorkflowShift,
            format!("Tool combination changed: {}", join(current)),
            "multiple_to_multiple",
        )
    } else if prev_count == 1 && count == 1 {
        (
            EventKind::ToolSwitch,
            format!("Tool switched: {} → {}", prev[0], current[0]),
            "single_to_single",
        )
    } else {
        return None;
    };

    let mut event = TimelineEvent::new(kind, description, timestamp, EventSource::Feed);
    event.data = json!({
        "tools": names(current),
        "prev_tools": names(prev),
        "action": kind.as_str(),
        "transition": transition,
    });
    Some(event)
}

fn join(tools: &[Tool]) -> String {
    tools
        .iter()
        .map(Tool::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn names(tools: &[Tool]) -> Vec<&'static str> {
    tools.iter().map(Tool::as_str).collect()
}
