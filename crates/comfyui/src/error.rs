//! Error taxonomy surfaced by [`JobCoordinator`](crate::coordinator::JobCoordinator).

use std::path::PathBuf;
use std::time::Duration;

use crate::api::{is_client_error, ComfyUIApiError};
use crate::registry::RegistryError;

/// Which wait phase ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Waiting for another process to release the backend.
    SlotWait,
    /// Waiting for the submitted job to reach a terminal status.
    Completion,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SlotWait => f.write_str("waiting for a free slot"),
            Self::Completion => f.write_str("waiting for job completion"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Network or connection failure.
    #[error("ComfyUI unreachable: {0}")]
    ServiceUnreachable(String),

    /// The backend refused the request.
    #[error("ComfyUI rejected the request ({status}): {body}")]
    ServiceRejected { status: u16, body: String },

    /// The backend ran the job and reported failure.
    #[error("Job {job_id} failed: {detail}")]
    JobFailed { job_id: String, detail: String },

    #[error("Timed out after {}s {phase}", after.as_secs())]
    Timeout { phase: TimeoutPhase, after: Duration },

    /// The job succeeded but one of its outputs could not be downloaded.
    #[error("Artifact '{filename}' could not be fetched: {detail}")]
    ArtifactNotFound { filename: String, detail: String },

    #[error("Cancelled")]
    Cancelled,

    /// The registry could not be locked or written while acquiring the slot.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A fetched artifact could not be written locally.
    #[error("Failed to write artifact to {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid response from ComfyUI: {0}")]
    InvalidResponse(String),
}

impl CoordinatorError {
    /// Whether resubmitting the same descriptor later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ServiceUnreachable(_) | Self::Timeout { .. } => true,
            Self::ServiceRejected { status, .. } => !is_client_error(*status),
            Self::JobFailed { .. }
            | Self::ArtifactNotFound { .. }
            | Self::Cancelled
            | Self::Registry(_)
            | Self::Storage { .. }
            | Self::InvalidResponse(_) => false,
        }
    }
}

impl From<ComfyUIApiError> for CoordinatorError {
    fn from(e: ComfyUIApiError) -> Self {
        match e {
            ComfyUIApiError::Unreachable(msg) => Self::ServiceUnreachable(msg),
            ComfyUIApiError::ApiError { status, body } => Self::ServiceRejected { status, body },
            ComfyUIApiError::ArtifactNotFound {
                filename,
                status,
                body,
            } => Self::ArtifactNotFound {
                filename,
                detail: format!("HTTP {status}: {body}"),
            },
            ComfyUIApiError::InvalidResponse(msg) => Self::InvalidResponse(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_map_onto_taxonomy() {
        let e: CoordinatorError = ComfyUIApiError::Unreachable("refused".into()).into();
        assert!(matches!(e, CoordinatorError::ServiceUnreachable(_)));

        let e: CoordinatorError = ComfyUIApiError::ApiError {
            status: 400,
            body: "invalid prompt".into(),
        }
        .into();
        assert!(matches!(e, CoordinatorError::ServiceRejected { status: 400, .. }));

        let e: CoordinatorError = ComfyUIApiError::ArtifactNotFound {
            filename: "a.png".into(),
            status: 404,
            body: String::new(),
        }
        .into();
        assert!(matches!(e, CoordinatorError::ArtifactNotFound { ref filename, .. } if filename == "a.png"));
    }

    #[test]
    fn retryability() {
        assert!(CoordinatorError::ServiceUnreachable("x".into()).is_retryable());
        assert!(CoordinatorError::Timeout {
            phase: TimeoutPhase::Completion,
            after: Duration::from_secs(300)
        }
        .is_retryable());
        assert!(!CoordinatorError::ServiceRejected {
            status: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(CoordinatorError::ServiceRejected {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!CoordinatorError::JobFailed {
            job_id: "j".into(),
            detail: "bad node".into()
        }
        .is_retryable());
    }

    #[test]
    fn timeout_message_names_phase() {
        let e = CoordinatorError::Timeout {
            phase: TimeoutPhase::Completion,
            after: Duration::from_secs(2),
        };
        assert_eq!(e.to_string(), "Timed out after 2s waiting for job completion");
    }
}
