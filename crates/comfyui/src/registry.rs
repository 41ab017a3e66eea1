//! File-backed table of in-flight jobs shared by every local process.
//!
//! The registry is a single JSON document mapping client IDs to entries:
//!
//! ```json
//! {"<client_id>": {"name": "client_4242", "workflow": "portrait", "status": "running", "start_time": 1738600000.5}}
//! ```
//!
//! Every mutation rereads and rewrites the whole document while holding
//! an exclusive OS lock on a sibling `<registry>.lock` file, so two
//! processes can never both observe "free" and both register. Writes go
//! through a temporary file and a rename, so lock-free readers always see
//! a complete document.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use comfyshare_core::types::Timestamp;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::retry::sleep_or_cancel;

/// Delay between attempts while another process holds the registry lock.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// File name used when no explicit registry path is configured.
pub const DEFAULT_REGISTRY_FILE: &str = "comfyui_queue.json";

/// Default registry location shared by all processes of this machine.
pub fn default_registry_path() -> PathBuf {
    std::env::temp_dir()
        .join("comfyshare")
        .join(DEFAULT_REGISTRY_FILE)
}

/// Lifecycle state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Running,
    /// Any status written by another tool; never counts as busy.
    #[serde(other)]
    Unknown,
}

/// One process's claim on the shared backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Map key in the persisted document; filled in on load.
    #[serde(skip)]
    pub client_id: String,
    #[serde(rename = "name")]
    pub process_label: String,
    #[serde(rename = "workflow")]
    pub job_label: String,
    pub status: EntryStatus,
    /// Seconds since the Unix epoch.
    pub start_time: f64,
}

impl RegistryEntry {
    pub fn started_at(&self) -> Option<Timestamp> {
        let secs = self.start_time.floor() as i64;
        let nanos = ((self.start_time - self.start_time.floor()) * 1e9) as u32;
        chrono::DateTime::from_timestamp(secs, nanos)
    }

    /// Time since the entry was registered, zero if the clock went backwards.
    pub fn elapsed(&self) -> Duration {
        let now = epoch_secs(Utc::now());
        Duration::try_from_secs_f64((now - self.start_time).max(0.0)).unwrap_or(Duration::MAX)
    }

    fn is_running(&self) -> bool {
        self.status == EntryStatus::Running
    }
}

/// Full registry contents, keyed by client ID.
pub type RegistryState = BTreeMap<String, RegistryEntry>;

/// Result of [`SharedJobRegistry::try_acquire`].
#[derive(Debug, Clone, PartialEq)]
pub enum Acquire {
    /// The caller is now registered as running.
    Acquired,
    /// Someone else holds the backend; nothing was written.
    Busy(Vec<RegistryEntry>),
}

/// Errors from registry mutations. Reads never fail.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Reading, writing or renaming the registry file failed.
    #[error("Registry I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Taking the cross-process lock failed.
    #[error("Failed to lock registry {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Handle on the shared registry file.
///
/// Cheap to clone; holds only paths and settings.
#[derive(Debug, Clone)]
pub struct SharedJobRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    stale_after: Option<Duration>,
}

impl SharedJobRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self {
            path,
            lock_path,
            stale_after: None,
        }
    }

    /// Treat running entries older than `age` as abandoned by a crashed
    /// process: they no longer count as busy and are removed on the next
    /// acquisition.
    pub fn with_stale_after(mut self, age: Duration) -> Self {
        self.stale_after = Some(age);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file every mutation locks.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Read the persisted state.
    ///
    /// A missing file yields an empty map. A corrupt or unreadable file
    /// also yields an empty map and logs a warning. A single malformed
    /// entry is skipped with a warning; the rest of the table survives.
    /// The older `{"clients": {...}, "pending": [...]}` layout is read as
    /// its `clients` table.
    pub fn load_state(&self) -> RegistryState {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return RegistryState::new(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Registry unreadable, treating as empty");
                return RegistryState::new();
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return RegistryState::new();
        }

        match serde_json::from_slice::<Map<String, Value>>(&bytes) {
            Ok(document) => self.parse_entries(document),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Registry corrupt, treating as empty");
                RegistryState::new()
            }
        }
    }

    /// Overwrite the full persisted state.
    pub fn persist_state(&self, state: &RegistryState) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let json = serde_json::to_vec_pretty(state)?;

        let tmp_path = self
            .path
            .with_extension(format!("tmp.{}", std::process::id()));
        let mut tmp = File::create(&tmp_path).map_err(|e| self.io_error(e))?;
        tmp.write_all(&json).map_err(|e| self.io_error(e))?;
        tmp.sync_all().map_err(|e| self.io_error(e))?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            self.io_error(e)
        })
    }

    /// Add a running entry for `client_id` stamped with the current time.
    pub fn register(
        &self,
        client_id: &str,
        process_label: &str,
        job_label: &str,
    ) -> Result<(), RegistryError> {
        self.with_lock(|| {
            let mut state = self.load_state();
            state.insert(client_id.to_string(), new_entry(client_id, process_label, job_label));
            self.persist_state(&state)
        })?;
        tracing::debug!(client_id, job_label, "Registered in job registry");
        Ok(())
    }

    /// Remove the entry for `client_id` if present.
    pub fn deregister(&self, client_id: &str) -> Result<(), RegistryError> {
        self.with_lock(|| self.deregister_locked(client_id))?;
        tracing::debug!(client_id, "Deregistered from job registry");
        Ok(())
    }

    /// Whether anyone other than `excluding` currently holds the backend.
    ///
    /// Busy entries are returned oldest first.
    pub fn is_busy(&self, excluding: Option<&str>) -> (bool, Vec<RegistryEntry>) {
        let busy = self.busy_entries(&self.load_state(), excluding);
        (!busy.is_empty(), busy)
    }

    /// Atomically check for contention and register if the slot is free.
    ///
    /// Stale entries (see [`with_stale_after`](Self::with_stale_after)) are
    /// removed as part of the same write.
    pub fn try_acquire(
        &self,
        client_id: &str,
        process_label: &str,
        job_label: &str,
    ) -> Result<Acquire, RegistryError> {
        self.with_lock(|| self.acquire_locked(client_id, process_label, job_label))
    }

    /// [`try_acquire`](Self::try_acquire) that never blocks the calling
    /// task on the file lock.
    ///
    /// While another process holds the lock, retries every
    /// [`LOCK_RETRY_INTERVAL`]. Returns `Ok(None)` if `cancel` fires
    /// first, in which case nothing was written.
    pub async fn try_acquire_cancellable(
        &self,
        client_id: &str,
        process_label: &str,
        job_label: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Acquire>, RegistryError> {
        let Some(_lock) = self.lock_async(cancel).await? else {
            return Ok(None);
        };
        self.acquire_locked(client_id, process_label, job_label).map(Some)
    }

    /// [`deregister`](Self::deregister) that waits for the file lock
    /// without blocking the calling task.
    pub async fn deregister_async(&self, client_id: &str) -> Result<(), RegistryError> {
        // Never cancelled: a release always completes.
        let never = CancellationToken::new();
        if let Some(_lock) = self.lock_async(&never).await? {
            self.deregister_locked(client_id)?;
        }
        tracing::debug!(client_id, "Deregistered from job registry");
        Ok(())
    }

    // ---- private helpers ----

    fn busy_entries(&self, state: &RegistryState, excluding: Option<&str>) -> Vec<RegistryEntry> {
        let mut busy: Vec<RegistryEntry> = state
            .values()
            .filter(|e| Some(e.client_id.as_str()) != excluding)
            .filter(|e| e.is_running() && !self.is_stale(e))
            .cloned()
            .collect();
        busy.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
        busy
    }

    fn is_stale(&self, entry: &RegistryEntry) -> bool {
        self.stale_after
            .is_some_and(|age| entry.elapsed() > age)
    }

    fn acquire_locked(
        &self,
        client_id: &str,
        process_label: &str,
        job_label: &str,
    ) -> Result<Acquire, RegistryError> {
        let mut state = self.load_state();
        let busy = self.busy_entries(&state, Some(client_id));
        if !busy.is_empty() {
            return Ok(Acquire::Busy(busy));
        }

        let before = state.len();
        state.retain(|id, entry| id == client_id || !self.is_stale(entry));
        if state.len() != before {
            tracing::warn!(removed = before - state.len(), "Pruned stale registry entries");
        }

        state.insert(client_id.to_string(), new_entry(client_id, process_label, job_label));
        self.persist_state(&state)?;
        Ok(Acquire::Acquired)
    }

    fn deregister_locked(&self, client_id: &str) -> Result<(), RegistryError> {
        let mut state = self.load_state();
        if state.remove(client_id).is_some() {
            self.persist_state(&state)?;
        }
        Ok(())
    }

    /// Accept both the flat `{client_id: entry}` table and the older
    /// layout that nests it under `clients`.
    fn parse_entries(&self, mut document: Map<String, Value>) -> RegistryState {
        let nested = matches!(
            document.get("clients"),
            Some(Value::Object(clients)) if !clients.contains_key("start_time")
        );
        let table = match document.remove("clients") {
            Some(Value::Object(clients)) if nested => clients,
            Some(other) => {
                document.insert("clients".into(), other);
                document
            }
            None => document,
        };

        let mut state = RegistryState::new();
        for (client_id, value) in table {
            match serde_json::from_value::<RegistryEntry>(value) {
                Ok(mut entry) => {
                    entry.client_id.clone_from(&client_id);
                    state.insert(client_id, entry);
                }
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    client_id = %client_id,
                    error = %e,
                    "Skipping malformed registry entry",
                ),
            }
        }
        state
    }

    /// Run `f` while holding the exclusive cross-process lock, blocking
    /// until it is available.
    fn with_lock<T>(
        &self,
        f: impl FnOnce() -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let lock = RegistryLock::open(&self.lock_path)?;
        lock.file
            .lock_exclusive()
            .map_err(|source| RegistryError::Lock {
                path: self.lock_path.clone(),
                source,
            })?;
        f()
    }

    /// Take the lock without blocking the runtime, polling while it is
    /// contended. `None` when cancelled.
    async fn lock_async(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<RegistryLock>, RegistryError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let lock = RegistryLock::open(&self.lock_path)?;
            match lock.file.try_lock_exclusive() {
                Ok(()) => return Ok(Some(lock)),
                Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {}
                Err(source) => {
                    return Err(RegistryError::Lock {
                        path: self.lock_path.clone(),
                        source,
                    })
                }
            }
            drop(lock);
            if !sleep_or_cancel(LOCK_RETRY_INTERVAL, cancel).await {
                return Ok(None);
            }
        }
    }

    fn io_error(&self, source: io::Error) -> RegistryError {
        RegistryError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Open handle on the lock file; unlocks on drop.
struct RegistryLock {
    file: File,
    path: PathBuf,
}

impl RegistryLock {
    fn open(path: &Path) -> Result<Self, RegistryError> {
        let io_error = |source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_error)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        // Unlocking a handle that was never locked is harmless.
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release registry lock");
        }
    }
}

fn new_entry(client_id: &str, process_label: &str, job_label: &str) -> RegistryEntry {
    RegistryEntry {
        client_id: client_id.to_string(),
        process_label: process_label.to_string(),
        job_label: job_label.to_string(),
        status: EntryStatus::Running,
        start_time: epoch_secs(Utc::now()),
    }
}

fn epoch_secs(ts: Timestamp) -> f64 {
    ts.timestamp_micros() as f64 / 1e6
}
