//! End-to-end protocol for running one job on the shared ComfyUI backend.
//!
//! [`JobCoordinator::run`] claims the backend in the
//! [`SharedJobRegistry`] (optionally waiting for other processes to
//! finish), submits the job, polls its history until a terminal status
//! or the timeout, downloads every produced artifact, and releases the
//! claim. Release is tied to a [`SlotGuard`], so it happens exactly once
//! on every exit path: success, failure, timeout, cancellation, or the
//! future being dropped.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use comfyshare_core::workflow::JobDescriptor;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::artifacts::{self, OutputDestination};
use crate::backend::ExecutionBackend;
use crate::error::{CoordinatorError, TimeoutPhase};
use crate::history::{CompletionOutcome, HistoryStatus, NodeArtifacts};
use crate::registry::{Acquire, RegistryEntry, RegistryError, SharedJobRegistry};
use crate::retry::{sleep_or_cancel, Backoff, RetryPolicy};

/// Default interval between registry checks while waiting for a slot.
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(5);

/// Default interval between history polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default job completion timeout.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// Default budget of consecutive failed history polls.
pub const DEFAULT_MAX_POLL_ERRORS: u32 = 5;

/// Upper bound on the backoff after a failed history poll.
const MAX_POLL_ERROR_DELAY: Duration = Duration::from_secs(10);

/// Per-run settings.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Wait for the backend to become free instead of returning
    /// [`RunOutcome::Busy`].
    pub wait: bool,
    /// Give up waiting for a slot after this long; `None` waits forever.
    pub max_wait: Option<Duration>,
    /// Time allowed between submission and a terminal status.
    pub timeout: Duration,
    pub wait_interval: Duration,
    pub poll_interval: Duration,
    /// Consecutive failed history polls tolerated before giving up.
    pub max_poll_errors: u32,
    /// Human-readable job name recorded in the registry.
    pub job_label: String,
    pub destination: OutputDestination,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            wait: false,
            max_wait: None,
            timeout: DEFAULT_JOB_TIMEOUT,
            wait_interval: DEFAULT_WAIT_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_errors: DEFAULT_MAX_POLL_ERRORS,
            job_label: "workflow".to_string(),
            destination: OutputDestination::default(),
        }
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: String,
    /// Local paths written, in the order the backend produced them.
    pub artifacts: Vec<PathBuf>,
}

/// Definitive outcome of [`JobCoordinator::run`] when no error occurred.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(JobReport),
    /// Not attempted: another process holds the backend and waiting was
    /// not requested. Carries the entries holding it.
    Busy(Vec<RegistryEntry>),
}

/// Runs jobs against one backend on behalf of one local process.
pub struct JobCoordinator<B> {
    backend: B,
    registry: SharedJobRegistry,
    client_id: String,
    process_label: String,
}

impl<B: ExecutionBackend> JobCoordinator<B> {
    /// Create a coordinator with a fresh client ID and a process label of
    /// the form `client_<pid>`.
    pub fn new(backend: B, registry: SharedJobRegistry) -> Self {
        Self {
            backend,
            registry,
            client_id: uuid::Uuid::new_v4().to_string(),
            process_label: format!("client_{}", std::process::id()),
        }
    }

    /// ID used both as the registry key and as ComfyUI's `client_id`.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &SharedJobRegistry {
        &self.registry
    }

    /// Run `descriptor` to completion on the shared backend.
    ///
    /// Returns [`RunOutcome::Busy`] without submitting anything when the
    /// backend is claimed and `options.wait` is false. Every other path
    /// releases this coordinator's registry entry. A failed release is
    /// logged and does not replace the job's own result.
    pub async fn run(
        &self,
        descriptor: JobDescriptor,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, CoordinatorError> {
        let slot = match self.acquire_slot(options, cancel).await? {
            SlotAcquisition::Acquired(slot) => slot,
            SlotAcquisition::Busy(entries) => return Ok(RunOutcome::Busy(entries)),
        };

        let result = self.execute(descriptor, options, cancel).await;
        slot.release().await;

        match &result {
            Ok(report) => tracing::info!(
                client_id = %self.client_id,
                job_id = %report.job_id,
                artifacts = report.artifacts.len(),
                "Job completed",
            ),
            Err(e) => tracing::warn!(client_id = %self.client_id, error = %e, "Job did not complete"),
        }
        result.map(RunOutcome::Completed)
    }

    /// Jobs currently running or queued on the backend.
    pub async fn queue_depth(&self) -> Result<usize, CoordinatorError> {
        Ok(self.backend.poll_queue_depth().await?)
    }

    // ---- private helpers ----

    /// Claim the registry slot, waiting if requested.
    async fn acquire_slot(
        &self,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<SlotAcquisition<'_>, CoordinatorError> {
        let started = Instant::now();
        let mut waiting = Backoff::new(RetryPolicy::fixed(options.wait_interval));

        loop {
            if cancel.is_cancelled() {
                return Err(CoordinatorError::Cancelled);
            }

            let attempt = self
                .registry
                .try_acquire_cancellable(
                    &self.client_id,
                    &self.process_label,
                    &options.job_label,
                    cancel,
                )
                .await?;
            let Some(attempt) = attempt else {
                return Err(CoordinatorError::Cancelled);
            };

            let busy = match attempt {
                Acquire::Acquired => {
                    tracing::info!(
                        client_id = %self.client_id,
                        job = %options.job_label,
                        "Acquired ComfyUI slot",
                    );
                    return Ok(SlotAcquisition::Acquired(SlotGuard {
                        registry: &self.registry,
                        client_id: &self.client_id,
                        released: false,
                    }));
                }
                Acquire::Busy(entries) => entries,
            };

            if waiting.attempts() == 0 {
                tracing::warn!(running = busy.len(), "ComfyUI is busy");
                for entry in &busy {
                    tracing::warn!(
                        name = %entry.process_label,
                        workflow = %entry.job_label,
                        running_secs = entry.elapsed().as_secs(),
                        "Slot held",
                    );
                }
            }

            if !options.wait {
                return Ok(SlotAcquisition::Busy(busy));
            }

            let waited = started.elapsed();
            if let Some(max_wait) = options.max_wait {
                if waited >= max_wait {
                    return Err(CoordinatorError::Timeout {
                        phase: TimeoutPhase::SlotWait,
                        after: max_wait,
                    });
                }
            }

            tracing::info!(
                waited_secs = waited.as_secs(),
                holder_running_secs = busy.first().map(|e| e.elapsed().as_secs()).unwrap_or(0),
                "Waiting for ComfyUI slot",
            );

            let mut delay = waiting.next_delay().unwrap_or(options.wait_interval);
            if let Some(max_wait) = options.max_wait {
                delay = delay.min(max_wait.saturating_sub(waited));
            }
            if !sleep_or_cancel(delay, cancel).await {
                return Err(CoordinatorError::Cancelled);
            }
        }
    }

    async fn execute(
        &self,
        descriptor: JobDescriptor,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<JobReport, CoordinatorError> {
        tracing::info!(client_id = %self.client_id, nodes = descriptor.len(), "Submitting workflow");
        let submission = tokio::select! {
            _ = cancel.cancelled() => return Err(CoordinatorError::Cancelled),
            result = self.backend.submit(&descriptor, &self.client_id) => result?,
        };
        tracing::info!(
            job_id = %submission.job_id,
            queue_number = submission.queue_number,
            "Workflow submitted",
        );

        let outputs = self
            .wait_for_completion(&submission.job_id, options, cancel)
            .await?;
        let artifacts = self
            .collect_artifacts(&outputs, &options.destination, cancel)
            .await?;

        Ok(JobReport {
            job_id: submission.job_id,
            artifacts,
        })
    }

    /// Poll history until a terminal status, the timeout, or cancellation.
    async fn wait_for_completion(
        &self,
        job_id: &str,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<NodeArtifacts>, CoordinatorError> {
        let timed_out = || CoordinatorError::Timeout {
            phase: TimeoutPhase::Completion,
            after: options.timeout,
        };
        let deadline = Instant::now() + options.timeout;
        let mut errors = Backoff::new(RetryPolicy::exponential(
            options.poll_interval,
            MAX_POLL_ERROR_DELAY.max(options.poll_interval),
            options.max_poll_errors,
        ));

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }

            let polled = tokio::select! {
                _ = cancel.cancelled() => return Err(CoordinatorError::Cancelled),
                polled = tokio::time::timeout(remaining, self.backend.poll_history(job_id)) => polled,
            };

            let delay = match polled {
                Err(_elapsed) => return Err(timed_out()),
                Ok(Ok(HistoryStatus::Pending)) => {
                    errors.reset();
                    options.poll_interval
                }
                Ok(Ok(HistoryStatus::Done(CompletionOutcome::Success { outputs }))) => {
                    return Ok(outputs);
                }
                Ok(Ok(HistoryStatus::Done(CompletionOutcome::Failure { error_detail }))) => {
                    tracing::error!(job_id, error = %error_detail, "ComfyUI reported job failure");
                    return Err(CoordinatorError::JobFailed {
                        job_id: job_id.to_string(),
                        detail: error_detail,
                    });
                }
                Ok(Err(e)) => match errors.next_delay() {
                    Some(delay) => {
                        tracing::warn!(
                            job_id,
                            error = %e,
                            attempt = errors.attempts(),
                            "History poll failed, retrying",
                        );
                        delay
                    }
                    None => {
                        tracing::error!(job_id, error = %e, "History poll failed too many times");
                        return Err(e.into());
                    }
                },
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if !sleep_or_cancel(delay.min(remaining), cancel).await {
                return Err(CoordinatorError::Cancelled);
            }
        }
    }

    /// Download and persist every artifact in backend order.
    async fn collect_artifacts(
        &self,
        outputs: &[NodeArtifacts],
        destination: &OutputDestination,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, CoordinatorError> {
        let mut written = Vec::new();
        let mut taken = HashSet::new();

        for node in outputs {
            for artifact in &node.artifacts {
                let bytes = tokio::select! {
                    _ = cancel.cancelled() => return Err(CoordinatorError::Cancelled),
                    result = self.backend.fetch_artifact(artifact) => result?,
                };

                let path = destination.unique_path_for(written.len(), artifact, &taken);
                artifacts::persist(&path, &bytes)
                    .await
                    .map_err(|source| CoordinatorError::Storage {
                        path: path.clone(),
                        source,
                    })?;

                tracing::info!(
                    node_id = %node.node_id,
                    filename = %artifact.filename,
                    path = %path.display(),
                    bytes = bytes.len(),
                    "Artifact saved",
                );
                taken.insert(path.clone());
                written.push(path);
            }
        }

        if written.is_empty() {
            tracing::warn!("Job succeeded without producing any artifacts");
        }
        Ok(written)
    }
}

enum SlotAcquisition<'a> {
    Acquired(SlotGuard<'a>),
    Busy(Vec<RegistryEntry>),
}

/// Registry claim that is released when dropped.
///
/// [`release`](Self::release) waits for the registry lock without blocking
/// the runtime; `Drop` is the fallback for unwinding and dropped futures.
/// Deregistration failures are logged and never replace the job's own
/// outcome.
struct SlotGuard<'a> {
    registry: &'a SharedJobRegistry,
    client_id: &'a str,
    released: bool,
}

impl SlotGuard<'_> {
    async fn release(mut self) {
        let result = self.registry.deregister_async(self.client_id).await;
        self.released = true;
        self.log_release(result);
    }

    fn log_release(&self, result: Result<(), RegistryError>) {
        match result {
            Ok(()) => tracing::info!(client_id = %self.client_id, "Released ComfyUI slot"),
            Err(e) => tracing::error!(
                client_id = %self.client_id,
                error = %e,
                "Failed to release ComfyUI slot",
            ),
        }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            let result = self.registry.deregister(self.client_id);
            self.log_release(result);
        }
    }
}
