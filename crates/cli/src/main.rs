//! `comfyshare` -- run a ComfyUI workflow on a backend shared with other
//! local processes.
//!
//! Claims the backend in a registry file that every `comfyshare` process
//! on the machine consults, submits the workflow, waits for it, saves the
//! produced files, and releases the claim. Saved paths are printed to
//! stdout one per line; logs go to stderr.
//!
//! # Environment variables
//!
//! | Variable                       | Default                               | Description                      |
//! |--------------------------------|---------------------------------------|----------------------------------|
//! | `COMFYUI_URL`                  | `http://127.0.0.1:8188`               | ComfyUI base URL                 |
//! | `COMFYUI_REGISTRY_PATH`        | `<tmp>/comfyshare/comfyui_queue.json` | Shared registry file             |
//! | `COMFYUI_REQUEST_TIMEOUT_SECS` | `60`                                  | Per-request HTTP timeout         |
//! | `COMFYUI_JOB_TIMEOUT_SECS`     | `300`                                 | Submission-to-completion timeout |
//! | `COMFYUI_WAIT_INTERVAL_SECS`   | `5`                                   | Registry re-check interval       |
//! | `COMFYUI_POLL_INTERVAL_MS`     | `1000`                                | History poll interval            |
//! | `COMFYUI_STALE_AFTER_SECS`     | unset                                 | Prune entries older than this    |
//!
//! # Exit status
//!
//! `0` on success or `--status`, `3` when the backend is busy and
//! `--wait` was not given, `1` on any other failure.

mod commands;
mod config;

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comfyshare=info,comfyshare_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, releasing the backend");
            ctrl_c.cancel();
        }
    });

    let result = match (&cli.workflow, cli.status) {
        (_, true) => commands::status(&cli).await,
        (Some(workflow), false) => commands::run(&cli, workflow, &cancel).await,
        (None, false) => Err(anyhow::anyhow!("--workflow is required")),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "comfyshare failed");
            ExitCode::FAILURE
        }
    }
}
