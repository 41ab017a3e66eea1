//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the four calls the coordinator needs (workflow submission,
//! history polling, queue inspection, artifact download) using
//! [`reqwest`]. Every request carries a bounded timeout, and TLS
//! certificates are not verified: ComfyUI instances run on a trusted
//! local network, often behind self-signed certificates.

use std::time::Duration;

use async_trait::async_trait;
use comfyshare_core::workflow::JobDescriptor;
use reqwest::StatusCode;

use crate::backend::ExecutionBackend;
use crate::history::{self, ArtifactReference, HistoryStatus, QueueSnapshot, SubmissionResult};

/// Default per-request timeout, independent of the job timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Connection, DNS, TLS or timeout failure before a response arrived.
    #[error("ComfyUI unreachable: {0}")]
    Unreachable(String),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The `/view` endpoint had nothing for the requested artifact.
    #[error("Artifact '{filename}' not found ({status}): {body}")]
    ArtifactNotFound {
        filename: String,
        status: u16,
        body: String,
    },

    /// The response body could not be decoded.
    #[error("Invalid response from ComfyUI: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ComfyUIApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::Unreachable(e.to_string())
        }
    }
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    /// * `request_timeout` - Upper bound for any single HTTP call.
    pub fn new(api_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ComfyUIApiError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ComfyUIApiError::Unreachable(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (useful for connection pooling across multiple instances).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends `POST /api/prompt` with the descriptor and the caller's
    /// session ID (ComfyUI's `client_id`). Returns the server-assigned
    /// `prompt_id` and queue position.
    pub async fn submit_workflow(
        &self,
        descriptor: &JobDescriptor,
        session_id: &str,
    ) -> Result<SubmissionResult, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": descriptor.to_json(),
            "client_id": session_id,
        });

        let response = self
            .client
            .post(format!("{}/api/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve and interpret the execution history of one prompt.
    ///
    /// Sends `GET /api/history/{prompt_id}`.
    pub async fn get_history(&self, prompt_id: &str) -> Result<HistoryStatus, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/api/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        history::parse_history(prompt_id, &body)
            .map_err(|e| ComfyUIApiError::InvalidResponse(format!("history for {prompt_id}: {e}")))
    }

    /// Running and pending job counts via `GET /api/queue`.
    pub async fn get_queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/api/queue", self.api_url))
            .send()
            .await?;

        let body: serde_json::Value = Self::parse_response(response).await?;
        history::parse_queue(&body)
            .map_err(|e| ComfyUIApiError::InvalidResponse(format!("queue: {e}")))
    }

    /// Download the raw bytes of a produced artifact via `GET /view`.
    pub async fn get_artifact(&self, artifact: &ArtifactReference) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", artifact.filename.as_str()),
                ("subfolder", artifact.subfolder.as_str()),
                ("type", artifact.storage_class.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = Self::body_text(response).await;
            return Err(ComfyUIApiError::ArtifactNotFound {
                filename: artifact.filename.clone(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = Self::body_text(response).await;
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ComfyUIApiError::InvalidResponse(e.to_string()))
    }

    async fn body_text(response: reqwest::Response) -> String {
        response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string())
    }
}

#[async_trait]
impl ExecutionBackend for ComfyUIApi {
    async fn submit(
        &self,
        descriptor: &JobDescriptor,
        session_id: &str,
    ) -> Result<SubmissionResult, ComfyUIApiError> {
        self.submit_workflow(descriptor, session_id).await
    }

    async fn poll_history(&self, job_id: &str) -> Result<HistoryStatus, ComfyUIApiError> {
        self.get_history(job_id).await
    }

    async fn poll_queue_depth(&self) -> Result<usize, ComfyUIApiError> {
        Ok(self.get_queue().await?.depth())
    }

    async fn fetch_artifact(&self, artifact: &ArtifactReference) -> Result<Vec<u8>, ComfyUIApiError> {
        self.get_artifact(artifact).await
    }
}

/// Whether an HTTP status means the request itself was refused rather
/// than the server being temporarily unhealthy.
pub fn is_client_error(status: u16) -> bool {
    StatusCode::from_u16(status).is_ok_and(|s| s.is_client_error())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_trimmed() {
        let api = ComfyUIApi::with_client(reqwest::Client::new(), "http://host:8188/");
        assert_eq!(api.api_url(), "http://host:8188");
    }

    #[test]
    fn client_error_classification() {
        assert!(is_client_error(400));
        assert!(is_client_error(404));
        assert!(!is_client_error(500));
        assert!(!is_client_error(200));
    }
}
