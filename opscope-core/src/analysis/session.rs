//! Analysis session state machine
//!
//! At most one remote analysis job is allowed at a time:
//! `Idle -> Starting -> Running -> Idle`. A start while not idle is
//! rejected synchronously, before the service is contacted. Stop is
//! local-only and idempotent; the remote job may keep running server-side,
//! which callers learn from [`StopOutcome`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AnalysisConfig;
use crate::error::{Error, Result};

use super::client::AnalysisClient;
use super::{AnalysisKind, AnalysisStatus};

/// The one open analysis session.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSession {
    /// Job identifier issued by the service
    pub job_id: String,
    /// Procedure this session analyzes
    pub operation_id: String,
    pub kind: AnalysisKind,
    pub started_at: DateTime<Utc>,
    /// Provider-reported lifecycle state at start time
    pub state: String,
}

/// Result of a stop request. Never an error: stopping with nothing
/// running is a tolerated no-op.
#[derive(Debug, Clone)]
pub enum StopOutcome {
    /// Local state was cleared. The remote job has no stop endpoint and
    /// may continue running server-side.
    Stopped { session: Option<AnalysisSession> },
    NothingRunning,
}

impl StopOutcome {
    pub fn stopped(&self) -> bool {
        matches!(self, StopOutcome::Stopped { .. })
    }
}

struct Slot {
    status: AnalysisStatus,
    session: Option<AnalysisSession>,
}

/// Serializes start/stop of the single allowed analysis session.
pub struct SessionController {
    client: AnalysisClient,
    slot: Mutex<Slot>,
}

impl SessionController {
    /// Create a controller from configuration
    ///
    /// Returns `None` when no analysis service is configured.
    pub fn new(config: &AnalysisConfig) -> Result<Option<Self>> {
        if !config.is_ready() {
            return Ok(None);
        }

        let client = AnalysisClient::new(config)?;
        Ok(Some(Self {
            client,
            slot: Mutex::new(Slot {
                status: AnalysisStatus::Idle,
                session: None,
            }),
        }))
    }

    pub fn status(&self) -> AnalysisStatus {
        self.slot.lock().status
    }

    pub fn current_session(&self) -> Option<AnalysisSession> {
        self.slot.lock().session.clone()
    }

    /// Start an analysis job for `video_id`.
    ///
    /// Rejects with [`Error::SessionConflict`] unless idle — synchronously,
    /// without contacting the service, and without queueing. On service
    /// failure the controller returns to idle; there is no automatic retry.
    pub async fn start(
        &self,
        kind: AnalysisKind,
        operation_id: &str,
        video_id: &str,
    ) -> Result<AnalysisSession> {
        {
            let mut slot = self.slot.lock();
            if slot.status != AnalysisStatus::Idle {
                return Err(Error::SessionConflict);
            }
            slot.status = AnalysisStatus::Starting;
        }

        match self.client.start_job(kind, video_id).await {
            Ok(job) => {
                let session = AnalysisSession {
                    job_id: job.job_id,
                    operation_id: operation_id.to_string(),
                    kind,
                    started_at: Utc::now(),
                    state: job.state,
                };

                let mut slot = self.slot.lock();
                // stop() may have forced idle while the request was in
                // flight; the acknowledgment loses.
                if slot.status != AnalysisStatus::Starting {
                    tracing::warn!(
                        job_id = %session.job_id,
                        "Job started but session was stopped locally; remote job may still be running"
                    );
                    return Err(Error::RemoteService(
                        "session was stopped before the job start completed".to_string(),
                    ));
                }
                slot.status = AnalysisStatus::Running;
                slot.session = Some(session.clone());
                tracing::info!(job_id = %session.job_id, kind = %kind, "Analysis session started");
                Ok(session)
            }
            Err(e) => {
                let mut slot = self.slot.lock();
                slot.status = AnalysisStatus::Idle;
                slot.session = None;
                tracing::warn!(kind = %kind, error = %e, "Failed to start analysis session");
                Err(e)
            }
        }
    }

    /// Stop the local session unconditionally.
    ///
    /// Best-effort and local-only: the service has no stop endpoint, so
    /// the remote job may keep running. Idempotent — stopping with nothing
    /// running returns [`StopOutcome::NothingRunning`].
    pub fn stop(&self) -> StopOutcome {
        let mut slot = self.slot.lock();
        match slot.status {
            AnalysisStatus::Idle => StopOutcome::NothingRunning,
            AnalysisStatus::Starting | AnalysisStatus::Running => {
                slot.status = AnalysisStatus::Idle;
                let session = slot.session.take();
                if let Some(ref session) = session {
                    tracing::info!(job_id = %session.job_id, "Analysis session stopped (local only)");
                }
                StopOutcome::Stopped { session }
            }
        }
    }

    /// Check if the analysis service is reachable.
    pub async fn health_check(&self) -> bool {
        self.client.health_check().await
    }

    /// Force a running session into the slot, bypassing the service.
    #[cfg(test)]
    fn force_running(&self, session: AnalysisSession) {
        let mut slot = self.slot.lock();
        slot.status = AnalysisStatus::Running;
        slot.session = Some(session);
    }
}
