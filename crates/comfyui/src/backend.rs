//! The four operations the coordinator needs from an execution backend.
//!
//! [`ComfyUIApi`](crate::api::ComfyUIApi) is the production
//! implementation; tests substitute scripted stubs.

use async_trait::async_trait;
use comfyshare_core::workflow::JobDescriptor;

use crate::api::ComfyUIApiError;
use crate::history::{ArtifactReference, HistoryStatus, SubmissionResult};

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Queue `descriptor`, tagged with the caller's session ID.
    async fn submit(
        &self,
        descriptor: &JobDescriptor,
        session_id: &str,
    ) -> Result<SubmissionResult, ComfyUIApiError>;

    /// Current state of a submitted job.
    async fn poll_history(&self, job_id: &str) -> Result<HistoryStatus, ComfyUIApiError>;

    /// Jobs currently running or queued on the backend.
    async fn poll_queue_depth(&self) -> Result<usize, ComfyUIApiError>;

    /// Raw bytes of one produced artifact.
    async fn fetch_artifact(&self, artifact: &ArtifactReference) -> Result<Vec<u8>, ComfyUIApiError>;
}
