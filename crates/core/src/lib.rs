//! Shared domain types for the comfyshare workspace.
//!
//! Holds the job descriptor model submitted to ComfyUI, the core error
//! type, and common type aliases.

pub mod error;
pub mod types;
pub mod workflow;
