//! Inbound message classification
//!
//! Raw feed payloads arrive as parsed JSON alongside the topic they were
//! published on. This module decides what each message *is* before any
//! state is touched:
//!
//! ```text
//! ┌──────────────┐     ┌────────────┐     ┌──────────────────┐
//! │ Feed payload │ ──► │ classify() │ ──► │ StageReconciler  │
//! │ (topic+JSON) │     │  (pure)    │     │ ToolReconciler   │
//! └──────────────┘     └────────────┘     └──────────────────┘
//! ```
//!
//! Classification is pure — no side effects, no reconciler state — so the
//! topic/shape rules are table-testable in isolation.

mod classifier;

pub use classifier::{
    classify, Classification, StageStatus, StageTransition, ToolInventory, Topic, TOPIC_STAGE,
    TOPIC_STATUS, TOPIC_TOOL,
};
