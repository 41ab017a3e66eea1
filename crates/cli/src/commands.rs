//! The two things the binary does: run a workflow, or report status.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use comfyshare_comfyui::{CoordinatorError, JobCoordinator, RunOutcome};
use comfyshare_core::workflow::JobDescriptor;
use tokio_util::sync::CancellationToken;

use crate::config::{job_label, Cli};

/// Exit status when the backend is held by someone else and `--wait` was
/// not given.
pub const EXIT_BUSY: u8 = 3;

/// Run one workflow through the shared backend.
pub async fn run(cli: &Cli, workflow: &Path, cancel: &CancellationToken) -> Result<ExitCode> {
    let descriptor = load_descriptor(workflow, cli.seed).await?;
    let options = cli.run_options(job_label(workflow));
    let coordinator = JobCoordinator::new(cli.api()?, cli.registry());

    tracing::info!(
        workflow = %workflow.display(),
        server = %cli.server_url,
        registry = %coordinator.registry().path().display(),
        client_id = %coordinator.client_id(),
        "Running workflow",
    );

    match coordinator.run(descriptor, &options, cancel).await {
        Ok(RunOutcome::Completed(report)) => {
            for path in &report.artifacts {
                println!("{}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Ok(RunOutcome::Busy(entries)) => {
            eprintln!(
                "ComfyUI is busy ({} job(s) running); rerun with --wait to queue behind them",
                entries.len()
            );
            Ok(ExitCode::from(EXIT_BUSY))
        }
        Err(CoordinatorError::Cancelled) => {
            tracing::warn!("Interrupted");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            if e.is_retryable() {
                tracing::info!("The failure looks transient; retrying later may succeed");
            }
            Err(e.into())
        }
    }
}

/// Print who holds the backend and how deep its queue is.
///
/// An unreachable backend is reported, not treated as a failure.
pub async fn status(cli: &Cli) -> Result<ExitCode> {
    let registry = cli.registry();
    let (busy, entries) = registry.is_busy(None);

    if busy {
        println!("ComfyUI: busy ({} running)", entries.len());
        for entry in &entries {
            println!(
                "  {}: {} (running {} s)",
                entry.process_label,
                entry.job_label,
                entry.elapsed().as_secs()
            );
        }
    } else {
        println!("ComfyUI: idle");
    }

    match cli.api()?.get_queue().await {
        Ok(queue) => println!(
            "Queue depth: {} ({} running, {} pending)",
            queue.depth(),
            queue.running,
            queue.pending
        ),
        Err(e) => println!("Queue depth: unavailable ({} unreachable: {e})", cli.server_url),
    }

    Ok(ExitCode::SUCCESS)
}

/// Read and validate a workflow file, applying the seed override if any.
pub async fn load_descriptor(path: &Path, seed: Option<u64>) -> Result<JobDescriptor> {
    if !path.is_file() {
        bail!("Workflow file not found: {}", path.display());
    }
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read workflow {}", path.display()))?;
    let descriptor = JobDescriptor::from_json_str(&text)
        .with_context(|| format!("Invalid workflow {}", path.display()))?;

    let Some(seed) = seed else {
        return Ok(descriptor);
    };
    let (descriptor, changed) = descriptor.with_seed(seed);
    if changed == 0 {
        tracing::warn!(seed, "Workflow has no sampler node; seed override ignored");
    } else {
        tracing::info!(seed, nodes = changed, "Seed override applied");
    }
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKFLOW: &str = r#"{
        "3": {"class_type": "KSampler", "inputs": {"seed": 1, "model": ["4", 0]}},
        "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "sd15.safetensors"}}
    }"#;

    #[tokio::test]
    async fn missing_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_descriptor(&dir.path().join("absent.json"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn dangling_link_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(
            &path,
            r#"{"3": {"class_type": "KSampler", "inputs": {"model": ["99", 0]}}}"#,
        )
        .unwrap();

        let err = load_descriptor(&path, None).await.unwrap_err();
        assert!(format!("{err:#}").contains("Invalid workflow"));
    }

    #[tokio::test]
    async fn seed_override_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portrait.json");
        std::fs::write(&path, WORKFLOW).unwrap();

        let descriptor = load_descriptor(&path, Some(1234)).await.unwrap();
        assert_eq!(descriptor.to_json()["3"]["inputs"]["seed"], 1234);

        let untouched = load_descriptor(&path, None).await.unwrap();
        assert_eq!(untouched.to_json()["3"]["inputs"]["seed"], 1);
    }
}
