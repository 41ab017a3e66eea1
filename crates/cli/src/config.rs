//! Command-line flags, their environment fallbacks, and conversion into
//! library configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use comfyshare_comfyui::api::ComfyUIApiError;
use comfyshare_comfyui::artifacts::OutputDestination;
use comfyshare_comfyui::coordinator::DEFAULT_MAX_POLL_ERRORS;
use comfyshare_comfyui::registry::default_registry_path;
use comfyshare_comfyui::{ComfyUIApi, RunOptions, SharedJobRegistry};

/// ComfyUI's default listen address.
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8188";

#[derive(Debug, Parser)]
#[command(name = "comfyshare", version)]
#[command(
    about = "Run ComfyUI workflows from several local processes that share one backend",
    long_about = None
)]
pub struct Cli {
    /// Workflow file in ComfyUI API JSON format
    #[arg(short, long, value_name = "PATH", required_unless_present = "status")]
    pub workflow: Option<PathBuf>,

    /// ComfyUI base URL
    #[arg(short, long, env = "COMFYUI_URL", default_value = DEFAULT_SERVER_URL)]
    pub server_url: String,

    /// Output directory, or file path for the first artifact
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Override the seed of every sampler node
    #[arg(long)]
    pub seed: Option<u64>,

    /// Wait for the backend to become free instead of exiting
    #[arg(short = 'W', long)]
    pub wait: bool,

    /// Show who holds the backend and its queue depth, then exit
    #[arg(long, conflicts_with_all = ["workflow", "wait", "output", "seed"])]
    pub status: bool,

    /// Seconds to wait for the job to finish after submission
    #[arg(
        long,
        value_name = "SECS",
        env = "COMFYUI_JOB_TIMEOUT_SECS",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub timeout: u64,

    /// Give up waiting for the backend after this many seconds
    #[arg(long, value_name = "SECS", requires = "wait")]
    pub max_wait: Option<u64>,

    /// Shared registry file [default: <tmp>/comfyshare/comfyui_queue.json]
    #[arg(long, value_name = "PATH", env = "COMFYUI_REGISTRY_PATH")]
    pub registry: Option<PathBuf>,

    /// Seconds allowed for any single HTTP request
    #[arg(
        long,
        value_name = "SECS",
        env = "COMFYUI_REQUEST_TIMEOUT_SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub request_timeout: u64,

    /// Seconds between registry checks while waiting
    #[arg(
        long,
        value_name = "SECS",
        env = "COMFYUI_WAIT_INTERVAL_SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub wait_interval: u64,

    /// Milliseconds between history polls
    #[arg(
        long,
        value_name = "MS",
        env = "COMFYUI_POLL_INTERVAL_MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub poll_interval_ms: u64,

    /// Ignore and prune registry entries older than this many seconds
    #[arg(long, value_name = "SECS", env = "COMFYUI_STALE_AFTER_SECS")]
    pub stale_after: Option<u64>,
}

impl Cli {
    pub fn registry(&self) -> SharedJobRegistry {
        let path = self.registry.clone().unwrap_or_else(default_registry_path);
        let registry = SharedJobRegistry::new(path);
        match self.stale_after {
            Some(secs) => registry.with_stale_after(Duration::from_secs(secs)),
            None => registry,
        }
    }

    pub fn api(&self) -> Result<ComfyUIApi, ComfyUIApiError> {
        ComfyUIApi::new(&self.server_url, Duration::from_secs(self.request_timeout))
    }

    pub fn run_options(&self, job_label: String) -> RunOptions {
        RunOptions {
            wait: self.wait,
            max_wait: self.max_wait.map(Duration::from_secs),
            timeout: Duration::from_secs(self.timeout),
            wait_interval: Duration::from_secs(self.wait_interval),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_poll_errors: DEFAULT_MAX_POLL_ERRORS,
            job_label,
            destination: OutputDestination::resolve(self.output.as_deref()),
        }
    }
}

/// Registry label for a workflow file: its stem, e.g. `portrait` for
/// `flows/portrait.json`.
pub fn job_label(workflow: &Path) -> String {
    workflow
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "workflow".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "comfyshare",
            "-w",
            "flows/portrait.json",
            "-s",
            "http://gpu-box:8188",
            "-o",
            "out/cover.png",
            "--seed",
            "42",
            "-W",
            "--max-wait",
            "120",
            "--timeout",
            "600",
        ])
        .unwrap();

        assert_eq!(cli.workflow.as_deref(), Some(Path::new("flows/portrait.json")));
        assert_eq!(cli.server_url, "http://gpu-box:8188");
        assert_eq!(cli.seed, Some(42));
        assert!(cli.wait);

        let options = cli.run_options(job_label(Path::new("flows/portrait.json")));
        assert!(options.wait);
        assert_eq!(options.max_wait, Some(Duration::from_secs(120)));
        assert_eq!(options.timeout, Duration::from_secs(600));
        assert_eq!(options.job_label, "portrait");
        assert_eq!(
            options.destination,
            OutputDestination::File(PathBuf::from("out/cover.png"))
        );
    }

    #[test]
    fn workflow_required_unless_status() {
        assert!(Cli::try_parse_from(["comfyshare"]).is_err());
        let cli = Cli::try_parse_from(["comfyshare", "--status"]).unwrap();
        assert!(cli.status);
        assert!(cli.workflow.is_none());
    }

    #[test]
    fn status_conflicts_with_run_flags() {
        assert!(Cli::try_parse_from(["comfyshare", "--status", "-w", "a.json"]).is_err());
        assert!(Cli::try_parse_from(["comfyshare", "--status", "--wait"]).is_err());
    }

    #[test]
    fn max_wait_requires_wait() {
        assert!(Cli::try_parse_from(["comfyshare", "-w", "a.json", "--max-wait", "5"]).is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(Cli::try_parse_from(["comfyshare", "-w", "a.json", "--timeout", "0"]).is_err());
    }

    #[test]
    fn explicit_registry_and_stale_limit() {
        let cli = Cli::try_parse_from([
            "comfyshare",
            "-w",
            "a.json",
            "--registry",
            "/tmp/shared/queue.json",
            "--stale-after",
            "3600",
        ])
        .unwrap();
        assert_eq!(cli.registry().path(), Path::new("/tmp/shared/queue.json"));
    }

    #[test]
    fn job_label_falls_back_for_odd_paths() {
        assert_eq!(job_label(Path::new("a/b/upscale.api.json")), "upscale.api");
        assert_eq!(job_label(Path::new("")), "workflow");
    }
}
