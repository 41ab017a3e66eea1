//! ComfyUI history and queue response types and parsers.
//!
//! `GET /api/history/{prompt_id}` returns an object keyed by prompt ID:
//!
//! ```json
//! {"<prompt_id>": {"status": {"status_str": "success", "completed": true},
//!                  "outputs": {"9": {"images": [{"filename": "a.png", "subfolder": "", "type": "output"}]}}}}
//! ```
//!
//! The un-wrapped `{"status": ..., "outputs": ...}` form is accepted too,
//! and an empty object means the prompt has not finished yet. This module
//! turns either shape into a [`HistoryStatus`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default storage class for artifacts when the backend omits `type`.
pub const DEFAULT_STORAGE_CLASS: &str = "output";

/// Response returned by `POST /api/prompt` after queuing a job.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionResult {
    /// Server-assigned identifier for the queued prompt; the poll key.
    #[serde(rename = "prompt_id")]
    pub job_id: String,
    /// Position in the execution queue.
    #[serde(rename = "number", default)]
    pub queue_number: i64,
}

/// A produced file addressable through the `/view` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// `output`, `temp` or `intermediate`.
    #[serde(rename = "type", default = "default_storage_class")]
    pub storage_class: String,
}

fn default_storage_class() -> String {
    DEFAULT_STORAGE_CLASS.to_string()
}

/// Artifacts produced by a single node, in backend order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeArtifacts {
    pub node_id: String,
    pub artifacts: Vec<ArtifactReference>,
}

/// Terminal result of a job as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Outputs keyed by node, in the order the backend listed them.
    Success { outputs: Vec<NodeArtifacts> },
    /// Backend-supplied error detail, passed through verbatim.
    Failure { error_detail: String },
}

/// Result of a single history poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryStatus {
    Pending,
    Done(CompletionOutcome),
}

/// Running and pending job counts from `GET /api/queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueSnapshot {
    pub running: usize,
    pub pending: usize,
}

impl QueueSnapshot {
    pub fn depth(&self) -> usize {
        self.running + self.pending
    }
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    status: Option<StatusBlock>,
    #[serde(default)]
    outputs: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct StatusBlock {
    #[serde(default, alias = "status_str")]
    status: Option<String>,
    #[serde(default)]
    completed: Option<bool>,
    #[serde(default)]
    errors: Option<Value>,
    #[serde(default)]
    messages: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    #[serde(default)]
    queue_running: Vec<Value>,
    #[serde(default)]
    queue_pending: Vec<Value>,
}

/// Interpret a history response body for `job_id`.
///
/// Returns `Err` only when the body is structurally unusable (not an
/// object, or an entry that does not deserialize).
pub fn parse_history(job_id: &str, body: &Value) -> Result<HistoryStatus, serde_json::Error> {
    let Some(obj) = body.as_object() else {
        return Err(serde::de::Error::custom("history response is not a JSON object"));
    };

    let entry = if let Some(wrapped) = obj.get(job_id) {
        wrapped.clone()
    } else if obj.contains_key("status") || obj.contains_key("outputs") {
        body.clone()
    } else {
        return Ok(HistoryStatus::Pending);
    };

    let entry: HistoryEntry = serde_json::from_value(entry)?;
    let Some(status) = entry.status else {
        return Ok(HistoryStatus::Pending);
    };

    let outcome = match status.status.as_deref() {
        Some("success") => CompletionOutcome::Success {
            outputs: parse_outputs(&entry.outputs),
        },
        Some("failed" | "error") => CompletionOutcome::Failure {
            error_detail: error_detail(&status),
        },
        None if status.completed == Some(true) => CompletionOutcome::Success {
            outputs: parse_outputs(&entry.outputs),
        },
        _ => return Ok(HistoryStatus::Pending),
    };
    Ok(HistoryStatus::Done(outcome))
}

/// Interpret a `/api/queue` response body.
pub fn parse_queue(body: &Value) -> Result<QueueSnapshot, serde_json::Error> {
    let queue = QueueResponse::deserialize(body)?;
    Ok(QueueSnapshot {
        running: queue.queue_running.len(),
        pending: queue.queue_pending.len(),
    })
}

/// Collect every file-like output of every node.
///
/// Besides `images`, video and audio nodes report `gifs`, `videos` or
/// `audio` lists with the same `{filename, subfolder, type}` shape, so any
/// array of objects carrying a `filename` is treated as artifacts.
fn parse_outputs(outputs: &Map<String, Value>) -> Vec<NodeArtifacts> {
    outputs
        .iter()
        .map(|(node_id, node_output)| {
            let artifacts = node_output
                .as_object()
                .into_iter()
                .flat_map(|o| o.values())
                .filter_map(Value::as_array)
                .flatten()
                .filter(|item| item.get("filename").is_some_and(Value::is_string))
                .filter_map(|item| ArtifactReference::deserialize(item).ok())
                .collect();
            NodeArtifacts {
                node_id: node_id.clone(),
                artifacts,
            }
        })
        .collect()
}

/// Prefer an explicit `errors` field; fall back to the exception message
/// from an `execution_error` entry in `messages`.
fn error_detail(status: &StatusBlock) -> String {
    match &status.errors {
        Some(Value::String(s)) => return s.clone(),
        Some(Value::Null) | None => {}
        Some(other) => return other.to_string(),
    }

    status
        .messages
        .iter()
        .filter_map(Value::as_array)
        .find(|m| m.first().and_then(Value::as_str) == Some("execution_error"))
        .and_then(|m| m.get(1))
        .and_then(|data| data.get("exception_message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "unknown error".to_string())
}
