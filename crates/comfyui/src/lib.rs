//! Shared-backend job coordination for ComfyUI.
//!
//! Lets several independent local processes take turns on one
//! single-worker ComfyUI server: an HTTP API wrapper, a file-backed
//! registry of in-flight jobs guarded by a cross-process lock, and a
//! coordinator that claims the backend, runs a job, downloads its
//! artifacts, and always releases its claim.

pub mod api;
pub mod artifacts;
pub mod backend;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod registry;
pub mod retry;

pub use api::ComfyUIApi;
pub use backend::ExecutionBackend;
pub use coordinator::{JobCoordinator, JobReport, RunOptions, RunOutcome};
pub use error::CoordinatorError;
pub use registry::SharedJobRegistry;
