//! Core domain types for opscope
//!
//! These types form the timeline vocabulary shared by the reconcilers and
//! the presentation-facing projections.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Procedure** | A scheduled operation that telemetry is attributed to |
//! | **Stage** | A named phase of the workflow, from a fixed vocabulary of seven |
//! | **Tool** | An instrument the external detector can report, fixed vocabulary of seven |
//! | **Timeline event** | An immutable record appended to the procedure timeline |
//! | **Workflow event** | A synthesized event describing the shape of a tool-set transition |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================
// Severity and provenance
// ============================================

/// How prominently an event should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

/// Where a timeline event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Delivered over the telemetry feed
    Feed,
    /// Synthesized by this library (session lifecycle, status notes)
    System,
    /// Injected manually by an operator
    User,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Feed => "feed",
            EventSource::System => "system",
            EventSource::User => "user",
        }
    }
}

// ============================================
// Event kinds
// ============================================

/// Closed vocabulary of timeline event types.
///
/// The severity of an event is a function of its kind, never chosen per
/// message (see [`EventKind::severity`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new workflow stage was entered
    StageBegin,
    /// One or two tools appeared in the inventory
    ToolDetected,
    /// One or two tools left the inventory
    ToolRemoved,
    /// First tool appeared after an empty inventory
    WorkflowStart,
    /// Multiple tools appeared at once after an empty inventory
    WorkflowIntenseStart,
    /// Inventory grew from a single tool to several
    WorkflowIntensify,
    /// Inventory shrank from several tools to one
    WorkflowFocus,
    /// All tools left the inventory
    WorkflowPause,
    /// A multi-tool inventory changed composition
    WorkflowShift,
    /// A single tool was exchanged for a different single tool
    ToolSwitch,
    /// A remote analysis job was started
    AnalysisStarted,
    /// The local analysis session was stopped
    AnalysisStopped,
    /// Operator-visible status annotation
    StatusNote,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StageBegin => "stage_begin",
            EventKind::ToolDetected => "tool_detected",
            EventKind::ToolRemoved => "tool_removed",
            EventKind::WorkflowStart => "workflow_start",
            EventKind::WorkflowIntenseStart => "workflow_intense_start",
            EventKind::WorkflowIntensify => "workflow_intensify",
            EventKind::WorkflowFocus => "workflow_focus",
            EventKind::WorkflowPause => "workflow_pause",
            EventKind::WorkflowShift => "workflow_shift",
            EventKind::ToolSwitch => "tool_switch",
            EventKind::AnalysisStarted => "analysis_started",
            EventKind::AnalysisStopped => "analysis_stopped",
            EventKind::StatusNote => "status_note",
        }
    }

    /// Deterministic severity per event kind.
    pub fn severity(&self) -> Severity {
        match self {
            EventKind::StageBegin
            | EventKind::WorkflowStart
            | EventKind::WorkflowIntenseStart => Severity::High,
            EventKind::ToolDetected
            | EventKind::WorkflowIntensify
            | EventKind::WorkflowFocus
            | EventKind::WorkflowShift
            | EventKind::AnalysisStarted => Severity::Medium,
            EventKind::ToolRemoved
            | EventKind::WorkflowPause
            | EventKind::ToolSwitch
            | EventKind::AnalysisStopped
            | EventKind::StatusNote => Severity::Low,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================
// Tools
// ============================================

/// Instruments the external detector can report.
///
/// Names arriving on the feed that are not in this vocabulary are dropped
/// during classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tool {
    Grasper,
    Bipolar,
    Hook,
    Scissors,
    Clipper,
    Irrigator,
    SpecimenBag,
}

impl Tool {
    /// All known tools, in canonical order.
    pub const ALL: [Tool; 7] = [
        Tool::Grasper,
        Tool::Bipolar,
        Tool::Hook,
        Tool::Scissors,
        Tool::Clipper,
        Tool::Irrigator,
        Tool::SpecimenBag,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::Grasper => "Grasper",
            Tool::Bipolar => "Bipolar",
            Tool::Hook => "Hook",
            Tool::Scissors => "Scissors",
            Tool::Clipper => "Clipper",
            Tool::Irrigator => "Irrigator",
            Tool::SpecimenBag => "SpecimenBag",
        }
    }
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Tool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Grasper" => Ok(Tool::Grasper),
            "Bipolar" => Ok(Tool::Bipolar),
            "Hook" => Ok(Tool::Hook),
            "Scissors" => Ok(Tool::Scissors),
            "Clipper" => Ok(Tool::Clipper),
            "Irrigator" => Ok(Tool::Irrigator),
            "SpecimenBag" => Ok(Tool::SpecimenBag),
            _ => Err(format!("unknown tool: {}", s)),
        }
    }
}

// ============================================
// Stages
// ============================================

/// The named workflow phases, in procedure order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Preparation,
    CalotTriangleDissection,
    ClippingCutting,
    GallbladderDissection,
    GallbladderPackaging,
    CleaningCoagulation,
    GallbladderRetraction,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preparation => "Preparation",
            Phase::CalotTriangleDissection => "CalotTriangleDissection",
            Phase::ClippingCutting => "ClippingCutting",
            Phase::GallbladderDissection => "GallbladderDissection",
            Phase::GallbladderPackaging => "GallbladderPackaging",
            Phase::CleaningCoagulation => "CleaningCoagulation",
            Phase::GallbladderRetraction => "GallbladderRetraction",
        }
    }

    /// Display color associated with this phase.
    pub fn color(&self) -> &'static str {
        match self {
            Phase::Preparation => "blue",
            Phase::CalotTriangleDissection => "emerald",
            Phase::ClippingCutting => "purple",
            Phase::GallbladderDissection => "amber",
            Phase::GallbladderPackaging => "rose",
            Phase::CleaningCoagulation => "orange",
            Phase::GallbladderRetraction => "cyan",
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Preparation" => Ok(Phase::Preparation),
            "CalotTriangleDissection" => Ok(Phase::CalotTriangleDissection),
            "ClippingCutting" => Ok(Phase::ClippingCutting),
            "GallbladderDissection" => Ok(Phase::GallbladderDissection),
            "GallbladderPackaging" => Ok(Phase::GallbladderPackaging),
            "CleaningCoagulation" => Ok(Phase::CleaningCoagulation),
            "GallbladderRetraction" => Ok(Phase::GallbladderRetraction),
            _ => Err(format!("unknown phase: {}", s)),
        }
    }
}

/// Color for a raw stage name; unknown stages map to the default.
pub fn stage_color(stage: &str) -> &'static str {
    stage
        .parse::<Phase>()
        .map(|p| p.color())
        .unwrap_or("gray")
}

/// Human-formatted stage name.
///
/// Underscores become spaces, a trailing literal `Stage` is dropped,
/// camel-case words are split, and the first letter is capitalized:
/// `GallbladderDissection` → `Gallbladder Dissection`.
pub fn clean_stage_name(raw: &str) -> String {
    let replaced = raw.replace('_', " ");
    let stripped = replaced.strip_suffix("Stage").unwrap_or(&replaced);

    let mut spaced = String::with_capacity(stripped.len() + 4);
    for c in stripped.chars() {
        if c.is_ascii_uppercase() {
            spaced.push(' ');
        }
        spaced.push(c);
    }

    let trimmed = spaced.trim();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => format!("{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => String::new(),
    }
}

// ============================================
// Timeline events
// ============================================

/// An immutable record on the procedure timeline.
///
/// Events are created once and never mutated. The `data` field preserves
/// the complete triggering payload for audit and debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Unique identifier (millisecond timestamp plus random suffix)
    pub id: String,
    /// Procedure this event belongs to, if one is loaded
    pub operation_id: Option<String>,
    /// Source-reported instant for feed events, creation time for synthetic ones
    pub timestamp: DateTime<Utc>,
    /// Event type
    pub kind: EventKind,
    /// Human-readable summary, produced deterministically from the trigger
    pub description: String,
    /// Derived from `kind`
    pub severity: Severity,
    /// Provenance marker
    pub source: EventSource,
    /// Detector confidence (0–1), passed through when the source reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Raw stage name, stage events only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Display color for `stage`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_color: Option<String>,
    /// Complete triggering payload
    pub data: serde_json::Value,
}

impl TimelineEvent {
    /// Create an event with the kind-derived severity and no optional fields set.
    pub fn new(
        kind: EventKind,
        description: impl Into<String>,
        timestamp: DateTime<Utc>,
        source: EventSource,
    ) -> Self {
        Self {
            id: event_id(kind.as_str()),
            operation_id: None,
            timestamp,
            kind,
            description: description.into(),
            severity: kind.severity(),
            source,
            confidence: None,
            stage: None,
            stage_color: None,
            data: serde_json::Value::Null,
        }
    }
}

/// Generate a unique event id: `<prefix>_<millis>_<8 hex chars>`.
pub fn event_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        prefix,
        Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}

// ============================================
// Procedures
// ============================================

/// The operation currently under observation.
///
/// Only the fields the core needs are modeled: event attribution and
/// starting the analysis job. Everything else rides in `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Procedure {
    /// Unique identifier
    pub id: String,
    /// Recording the analysis job should process
    pub video_id: String,
    /// Human-readable operation type
    pub procedure_type: String,
    /// Operating room, if known
    pub room: Option<String>,
    /// Scheduled start time, if known
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Extensible metadata
    pub metadata: serde_json::Value,
}

impl Procedure {
    pub fn new(id: impl Into<String>, video_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            video_id: video_id.into(),
            procedure_type: String::new(),
            room: None,
            scheduled_at: None,
            metadata: serde_json::json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_stage_name_camel_case() {
        assert_eq!(clean_stage_name("GallbladderDissection"), "Gallbladder Dissection");
        assert_eq!(
            clean_stage_name("CalotTriangleDissection"),
            "Calot Triangle Dissection"
        );
    }

    #[test]
    fn test_clean_stage_name_single_word() {
        assert_eq!(clean_stage_name("Preparation"), "Preparation");
    }

    #[test]
    fn test_clean_stage_name_underscores_and_suffix() {
        assert_eq!(clean_stage_name("cleaning_coagulation"), "Cleaning coagulation");
        assert_eq!(clean_stage_name("PreparationStage"), "Preparation");
    }

    #[test]
    fn test_clean_stage_name_empty() {
        assert_eq!(clean_stage_name(""), "");
    }

    #[test]
    fn test_stage_color_lookup() {
        assert_eq!(stage_color("Preparation"), "blue");
        assert_eq!(stage_color("GallbladderRetraction"), "cyan");
        assert_eq!(stage_color("SomethingElse"), "gray");
    }

    #[test]
    fn test_tool_round_trip() {
        for tool in Tool::ALL {
            assert_eq!(tool.as_str().parse::<Tool>(), Ok(tool));
        }
        assert!("Forceps".parse::<Tool>().is_err());
    }

    #[test]
    fn test_kind_severity() {
        assert_eq!(EventKind::StageBegin.severity(), Severity::High);
        assert_eq!(EventKind::WorkflowIntenseStart.severity(), Severity::High);
        assert_eq!(EventKind::ToolDetected.severity(), Severity::Medium);
        assert_eq!(EventKind::WorkflowPause.severity(), Severity::Low);
        assert_eq!(EventKind::ToolSwitch.severity(), Severity::Low);
    }

    #[test]
    fn test_event_id_shape() {
        let id = event_id("stage_begin");
        assert!(id.starts_with("stage_begin_"));
        let suffix = id.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 8);
    }

    #[test]
    fn test_event_new_derives_severity() {
        let event = TimelineEvent::new(
            EventKind::WorkflowStart,
            "Workflow started: Grasper",
            Utc::now(),
            EventSource::Feed,
        );
        assert_eq!(event.severity, Severity::High);
        assert!(event.stage.is_none());
        assert!(event.confidence.is_none());
    }
}
