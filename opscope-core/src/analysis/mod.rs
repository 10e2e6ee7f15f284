//! Remote analysis session management
//!
//! The analysis service runs one ML job per procedure recording and
//! publishes its findings onto the telemetry feed. This module owns the
//! client for starting jobs and the controller that serializes the single
//! allowed concurrent session.
//!
//! The service exposes no stop endpoint; stopping is local-only and the
//! remote job may keep running (see [`SessionController::stop`]).

mod client;
mod session;

pub use client::{AnalysisClient, JobStartResponse};
pub use session::{AnalysisSession, SessionController, StopOutcome};

use serde::{Deserialize, Serialize};

use crate::ingest::{TOPIC_STAGE, TOPIC_STATUS, TOPIC_TOOL};

/// The two supported analysis job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisKind {
    StageAnalysis,
    ToolDetection,
}

impl AnalysisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::StageAnalysis => "stage-analysis",
            AnalysisKind::ToolDetection => "tool-detection",
        }
    }

    /// URL path segment of the job-start endpoint for this kind.
    pub fn path(&self) -> &'static str {
        self.as_str()
    }

    /// Feed topics a session of this kind consumes. The status topic is
    /// shared by both kinds.
    pub fn topics(&self) -> &'static [&'static str] {
        match self {
            AnalysisKind::StageAnalysis => &[TOPIC_STAGE, TOPIC_STATUS],
            AnalysisKind::ToolDetection => &[TOPIC_TOOL, TOPIC_STATUS],
        }
    }
}

impl std::fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AnalysisKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stage-analysis" => Ok(AnalysisKind::StageAnalysis),
            "tool-detection" => Ok(AnalysisKind::ToolDetection),
            _ => Err(format!("unknown analysis kind: {}", s)),
        }
    }
}

/// Local lifecycle of the analysis session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Idle,
    Starting,
    Running,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Idle => "idle",
            AnalysisStatus::Starting => "starting",
            AnalysisStatus::Running => "running",
        }
    }
}
