//! Pure classifier for raw feed messages
//!
//! Rules, applied in order:
//! 1. A message carrying both `surgery_type` and `file_name` is a metadata
//!    announcement → [`Classification::Informational`].
//! 2. Stage topic: requires a non-empty `begin` timestamp and a non-empty
//!    string `stage` → [`Classification::StageTransition`], else `Invalid`.
//! 3. Status topic: requires `stage`, `status`, and `datetime` →
//!    [`Classification::StageStatus`], else `Invalid`.
//! 4. Tool topic: `tool`, if present, must be an array; entries are
//!    filtered against the tool vocabulary → [`Classification::ToolInventory`]
//!    (an empty filtered set is still meaningful).
//!
//! Unknown fields are never an error; the raw payload is retained on every
//! classified message so nothing is lost downstream.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::Tool;

/// Stage-transition topic name.
pub const TOPIC_STAGE: &str = "surgery/stage";
/// Tool-inventory topic name.
pub const TOPIC_TOOL: &str = "surgery/tool";
/// Stage-status topic name.
pub const TOPIC_STATUS: &str = "surgery/status";

/// The topics the classifier understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Stage,
    Tool,
    Status,
}

impl Topic {
    pub fn name(&self) -> &'static str {
        match self {
            Topic::Stage => TOPIC_STAGE,
            Topic::Tool => TOPIC_TOOL,
            Topic::Status => TOPIC_STATUS,
        }
    }

    /// Map a wire topic name to a known topic.
    pub fn from_name(name: &str) -> Option<Topic> {
        match name {
            TOPIC_STAGE => Some(Topic::Stage),
            TOPIC_TOOL => Some(Topic::Tool),
            TOPIC_STATUS => Some(Topic::Status),
            _ => None,
        }
    }
}

/// A validated stage-transition message.
#[derive(Debug, Clone)]
pub struct StageTransition {
    /// Raw stage name as announced by the source
    pub stage: String,
    /// Source-reported begin instant
    pub begin: DateTime<Utc>,
    /// Detector confidence, when reported
    pub confidence: Option<f64>,
    /// Complete original payload
    pub raw: Value,
}

/// A validated stage-status message.
#[derive(Debug, Clone)]
pub struct StageStatus {
    pub stage: String,
    /// Provider-defined status string, used verbatim
    pub status: String,
    pub datetime: DateTime<Utc>,
    /// Tool the provider associates with the stage, when reported
    pub tool: Option<String>,
    /// Complete original payload
    pub raw: Value,
}

/// A validated tool-inventory message.
#[derive(Debug, Clone)]
pub struct ToolInventory {
    /// Recognized tools in arrival order, duplicates removed
    pub tools: Vec<Tool>,
    /// Source-reported instant, when present and parseable
    pub timestamp: Option<DateTime<Utc>>,
    /// Detector confidence, when reported
    pub confidence: Option<f64>,
    /// Complete original payload
    pub raw: Value,
}

/// Outcome of classifying one (topic, message) pair.
#[derive(Debug, Clone)]
pub enum Classification {
    StageTransition(StageTransition),
    StageStatus(StageStatus),
    ToolInventory(ToolInventory),
    /// Metadata announcement; carries no state, ignored
    Informational,
    /// Malformed or semantically incomplete; dropped after logging
    Invalid { reason: String },
}

/// Classify a parsed message arriving on `topic`.
///
/// This function is pure: it never mutates reconciler state and never
/// performs I/O.
pub fn classify(topic: Topic, message: &Value) -> Classification {
    // Metadata announcements can appear on any topic and carry no telemetry.
    if has_field(message, "surgery_type") && has_field(message, "file_name") {
        return Classification::Informational;
    }

    match topic {
        Topic::Stage => classify_stage(message),
        Topic::Status => classify_status(message),
        Topic::Tool => classify_tool(message),
    }
}

fn classify_stage(message: &Value) -> Classification {
    let Some(begin) = non_empty_str(message, "begin") else {
        return invalid("missing begin timestamp");
    };
    let Some(stage) = non_empty_str(message, "stage") else {
        return invalid("missing stage name");
    };
    let Some(begin) = parse_instant(begin) else {
        return invalid("unparseable begin timestamp");
    };

    Classification::StageTransition(StageTransition {
        stage: stage.to_string(),
        begin,
        confidence: confidence(message),
        raw: message.clone(),
    })
}

fn classify_status(message: &Value) -> Classification {
    let Some(stage) = non_empty_str(message, "stage") else {
        return invalid("missing stage name");
    };
    let Some(status) = non_empty_str(message, "status") else {
        return invalid("missing status");
    };
    let Some(datetime) = non_empty_str(message, "datetime") else {
        return invalid("missing datetime");
    };
    let Some(datetime) = parse_instant(datetime) else {
        return invalid("unparseable datetime");
    };

    Classification::StageStatus(StageStatus {
        stage: stage.to_string(),
        status: status.to_string(),
        datetime,
        tool: non_empty_str(message, "tool").map(str::to_string),
        raw: message.clone(),
    })
}

fn classify_tool(message: &Value) -> Classification {
    let tools = match message.get("tool") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            let mut tools: Vec<Tool> = Vec::new();
            for item in items {
                if let Some(name) = item.as_str() {
                    if let Ok(tool) = name.parse::<Tool>() {
                        if !tools.contains(&tool) {
                            tools.push(tool);
                        }
                    }
                }
            }
            tools
        }
        Some(_) => return invalid("tool field is not an array"),
    };

    let timestamp = non_empty_str(message, "datetime").and_then(parse_instant);

    Classification::ToolInventory(ToolInventory {
        tools,
        timestamp,
        confidence: confidence(message),
        raw: message.clone(),
    })
}

fn invalid(reason: &str) -> Classification {
    Classification::Invalid {
        reason: reason.to_string(),
    }
}

fn has_field(message: &Value, field: &str) -> bool {
    message.get(field).map_or(false, |v| !v.is_null())
}

fn non_empty_str<'a>(message: &'a Value, field: &str) -> Option<&'a str> {
    message
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn confidence(message: &Value) -> Option<f64> {
    message.get("confidence").and_then(Value::as_f64)
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_names_round_trip() {
        for topic in [Topic::Stage, Topic::Tool, Topic::Status] {
            assert_eq!(Topic::from_name(topic.name()), Some(topic));
        }
        assert_eq!(Topic::from_name("surgery/other"), None);
    }

    #[test]
    fn test_metadata_announcement_is_informational_on_any_topic() {
        let message = json!({
            "surgery_type": "cholecystectomy",
            "file_name": "video01.mp4",
            "stage": "Preparation",
            "begin": "2024-05-14T09:00:00Z"
        });
        for topic in [Topic::Stage, Topic::Tool, Topic::Status] {
            assert!(matches!(
                classify(topic, &message),
                Classification::Informational
            ));
        }
    }

    #[test]
    fn test_stage_transition_valid() {
        let message = json!({
            "stage": "CalotTriangleDissection",
            "begin": "2024-05-14T09:12:00Z",
            "confidence": 0.93
        });
        match classify(Topic::Stage, &message) {
            Classification::StageTransition(msg) => {
                assert_eq!(msg.stage, "CalotTriangleDissection");
                assert_eq!(msg.confidence, Some(0.93));
                assert_eq!(msg.raw, message);
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn test_stage_transition_invalid_rows() {
        let cases = [
            json!({ "stage": "Preparation" }),
            json!({ "stage": "Preparation", "begin": "" }),
            json!({ "begin": "2024-05-14T09:12:00Z" }),
            json!({ "stage": "", "begin": "2024-05-14T09:12:00Z" }),
            json!({ "stage": 42, "begin": "2024-05-14T09:12:00Z" }),
            json!({ "stage": "Preparation", "begin": "not-a-time" }),
        ];
        for message in cases {
            assert!(
                matches!(
                    classify(Topic::Stage, &message),
                    Classification::Invalid { .. }
                ),
                "should be invalid: {}",
                message
            );
        }
    }

    #[test]
    fn test_status_valid() {
        let message = json!({
            "stage": "ClippingCutting",
            "status": "green",
            "datetime": "2024-05-14T09:30:00Z",
            "tool": "Clipper"
        });
        match classify(Topic::Status, &message) {
            Classification::StageStatus(msg) => {
                assert_eq!(msg.stage, "ClippingCutting");
                assert_eq!(msg.status, "green");
                assert_eq!(msg.tool.as_deref(), Some("Clipper"));
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn test_status_missing_fields() {
        let cases = [
            json!({ "status": "green", "datetime": "2024-05-14T09:30:00Z" }),
            json!({ "stage": "ClippingCutting", "datetime": "2024-05-14T09:30:00Z" }),
            json!({ "stage": "ClippingCutting", "status": "green" }),
        ];
        for message in cases {
            assert!(matches!(
                classify(Topic::Status, &message),
                Classification::Invalid { .. }
            ));
        }
    }

    #[test]
    fn test_tool_inventory_filters_unknown_names() {
        let message = json!({
            "tool": ["Grasper", "Lightsaber", "Hook", "Grasper"],
            "datetime": "2024-05-14T09:40:00Z"
        });
        match classify(Topic::Tool, &message) {
            Classification::ToolInventory(inv) => {
                assert_eq!(inv.tools, vec![Tool::Grasper, Tool::Hook]);
                assert!(inv.timestamp.is_some());
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn test_tool_inventory_empty_is_meaningful() {
        for message in [json!({}), json!({ "tool": [] }), json!({ "tool": null })] {
            match classify(Topic::Tool, &message) {
                Classification::ToolInventory(inv) => assert!(inv.tools.is_empty()),
                other => panic!("unexpected classification: {:?}", other),
            }
        }
    }

    #[test]
    fn test_tool_inventory_non_array_is_invalid() {
        let message = json!({ "tool": "Grasper" });
        assert!(matches!(
            classify(Topic::Tool, &message),
            Classification::Invalid { .. }
        ));
    }

    #[test]
    fn test_tool_inventory_unparseable_datetime_tolerated() {
        let message = json!({ "tool": ["Hook"], "datetime": "whenever" });
        match classify(Topic::Tool, &message) {
            Classification::ToolInventory(inv) => {
                assert_eq!(inv.tools, vec![Tool::Hook]);
                assert!(inv.timestamp.is_none());
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }
}
