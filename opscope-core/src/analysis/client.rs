//! HTTP client for the analysis job service
//!
//! The service exposes one job-start endpoint per analysis kind:
//! `POST <base>/<kind-path>/<video_id>`, answering `{job_id, state}` on
//! success and a non-2xx status on failure. There is no stop endpoint.

use std::time::Duration;

use serde::Deserialize;

use crate::config::AnalysisConfig;
use crate::error::{Error, Result};

use super::AnalysisKind;

/// Response from `POST /<kind>/<video_id>`
#[derive(Debug, Clone, Deserialize)]
pub struct JobStartResponse {
    /// Identifier of the launched job
    pub job_id: String,
    /// Provider-reported lifecycle state
    pub state: String,
}

/// HTTP client for the analysis job service
pub struct AnalysisClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl AnalysisClient {
    /// Create a new client from configuration
    ///
    /// Returns an error if the configuration is invalid or missing the
    /// base URL.
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| Error::Config("analysis.base_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
        })
    }

    /// Request a job start for `video_id`.
    pub async fn start_job(&self, kind: AnalysisKind, video_id: &str) -> Result<JobStartResponse> {
        let url = job_url(&self.base_url, kind, video_id);

        let response = self
            .http_client
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::RemoteService(format!("HTTP request failed: {}", e)))?;

        let status = response.status();

        if status.is_success() {
            response
                .json::<JobStartResponse>()
                .await
                .map_err(|e| Error::RemoteService(format!("failed to parse response: {}", e)))
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::RemoteService(format!(
                "API error ({}): {}",
                status, error_text
            )))
        }
    }

    /// Check if the analysis service is reachable
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);

        match self.http_client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Build the job-start URL, percent-encoding the video id.
fn job_url(base_url: &str, kind: AnalysisKind, video_id: &str) -> String {
    format!(
        "{}/{}/{}",
        base_url,
        kind.path(),
        urlencoding::encode(video_id)
    )
}
