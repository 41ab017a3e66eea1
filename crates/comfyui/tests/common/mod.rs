//! Shared fixtures for comfyshare-comfyui integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use comfyshare_comfyui::api::ComfyUIApiError;
use comfyshare_comfyui::artifacts::OutputDestination;
use comfyshare_comfyui::history::{
    ArtifactReference, CompletionOutcome, HistoryStatus, NodeArtifacts, SubmissionResult,
};
use comfyshare_comfyui::{ExecutionBackend, RunOptions, SharedJobRegistry};
use comfyshare_core::workflow::JobDescriptor;
use fs2::FileExt;
use serde_json::json;

/// What the stub answers once its scripted history is used up.
#[derive(Debug, Clone)]
pub enum Fallback {
    Pending,
    Unreachable,
}

/// Scripted in-memory backend that records every call.
pub struct StubBackend {
    history: Mutex<VecDeque<Result<HistoryStatus, ComfyUIApiError>>>,
    fallback: Fallback,
    submit_error: Mutex<Option<ComfyUIApiError>>,
    artifacts: HashMap<String, Vec<u8>>,
    observed: Option<SharedJobRegistry>,
    registered_at_submit: Mutex<Option<bool>>,
    on_submit: Option<Box<dyn Fn() + Send + Sync>>,
    pub submits: AtomicUsize,
    pub polls: AtomicUsize,
    pub fetches: AtomicUsize,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(VecDeque::new()),
            fallback: Fallback::Pending,
            submit_error: Mutex::new(None),
            artifacts: HashMap::new(),
            observed: None,
            registered_at_submit: Mutex::new(None),
            on_submit: None,
            submits: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Answer history polls with these results, in order.
    pub fn with_history(self, steps: Vec<Result<HistoryStatus, ComfyUIApiError>>) -> Self {
        *self.history.lock().unwrap() = steps.into();
        self
    }

    pub fn then(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_artifact(mut self, filename: &str, bytes: &[u8]) -> Self {
        self.artifacts.insert(filename.to_string(), bytes.to_vec());
        self
    }

    pub fn rejecting_submit(self, error: ComfyUIApiError) -> Self {
        *self.submit_error.lock().unwrap() = Some(error);
        self
    }

    /// Record whether the submitting client is registered at submit time.
    pub fn observing(mut self, registry: SharedJobRegistry) -> Self {
        self.observed = Some(registry);
        self
    }

    /// Run `hook` inside every submit call, after the slot is held.
    pub fn on_submit(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_submit = Some(Box::new(hook));
        self
    }

    pub fn registered_at_submit(&self) -> Option<bool> {
        *self.registered_at_submit.lock().unwrap()
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for StubBackend {
    async fn submit(
        &self,
        _descriptor: &JobDescriptor,
        session_id: &str,
    ) -> Result<SubmissionResult, ComfyUIApiError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if let Some(registry) = &self.observed {
            let state = registry.load_state();
            *self.registered_at_submit.lock().unwrap() = Some(state.contains_key(session_id));
        }
        if let Some(hook) = &self.on_submit {
            hook();
        }
        if let Some(e) = self.submit_error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(serde_json::from_value(json!({"prompt_id": "job-1", "number": 0})).unwrap())
    }

    async fn poll_history(&self, _job_id: &str) -> Result<HistoryStatus, ComfyUIApiError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if let Some(step) = self.history.lock().unwrap().pop_front() {
            return step;
        }
        match self.fallback {
            Fallback::Pending => Ok(HistoryStatus::Pending),
            Fallback::Unreachable => Err(ComfyUIApiError::Unreachable("connection refused".into())),
        }
    }

    async fn poll_queue_depth(&self) -> Result<usize, ComfyUIApiError> {
        Ok(0)
    }

    async fn fetch_artifact(&self, artifact: &ArtifactReference) -> Result<Vec<u8>, ComfyUIApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.artifacts
            .get(&artifact.filename)
            .cloned()
            .ok_or_else(|| ComfyUIApiError::ArtifactNotFound {
                filename: artifact.filename.clone(),
                status: 404,
                body: String::new(),
            })
    }
}

pub fn artifact(filename: &str) -> ArtifactReference {
    ArtifactReference {
        filename: filename.to_string(),
        subfolder: String::new(),
        storage_class: "output".to_string(),
    }
}

pub fn success(outputs: Vec<(&str, Vec<&str>)>) -> HistoryStatus {
    HistoryStatus::Done(CompletionOutcome::Success {
        outputs: outputs
            .into_iter()
            .map(|(node_id, files)| NodeArtifacts {
                node_id: node_id.to_string(),
                artifacts: files.into_iter().map(artifact).collect(),
            })
            .collect(),
    })
}

pub fn failure(detail: &str) -> HistoryStatus {
    HistoryStatus::Done(CompletionOutcome::Failure {
        error_detail: detail.to_string(),
    })
}

/// Minimal two-node text-to-image descriptor.
pub fn descriptor() -> JobDescriptor {
    JobDescriptor::from_json(&json!({
        "8": { "class_type": "EmptyLatentImage", "inputs": { "width": 512, "height": 512, "batch_size": 1 } },
        "9": { "class_type": "SaveImage", "inputs": { "images": ["8", 0], "filename_prefix": "test" } }
    }))
    .unwrap()
}

pub fn registry_in(dir: &Path) -> SharedJobRegistry {
    SharedJobRegistry::new(dir.join("comfyui_queue.json"))
}

/// Hold the registry's file lock through a separate handle, the way
/// another process would. Released when the returned file is dropped.
pub fn hold_registry_lock(registry: &SharedJobRegistry) -> File {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(registry.lock_path())
        .unwrap();
    file.lock_exclusive().unwrap();
    file
}

/// Make every later registry mutation fail: a directory cannot be opened
/// as the lock file, whatever the caller's privileges.
pub fn break_registry_lock(registry: &SharedJobRegistry) {
    let lock_path = registry.lock_path().to_path_buf();
    let _ = std::fs::remove_file(&lock_path);
    std::fs::create_dir(&lock_path).unwrap();
}

/// Fast intervals so tests finish quickly.
pub fn fast_options(output_dir: &Path) -> RunOptions {
    RunOptions {
        wait_interval: Duration::from_millis(50),
        poll_interval: Duration::from_millis(20),
        timeout: Duration::from_secs(5),
        job_label: "test-job".to_string(),
        destination: OutputDestination::Directory(output_dir.to_path_buf()),
        ..Default::default()
    }
}
