use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Command line interface for the thv sidecar supervisor.
#[derive(Parser, Debug)]
#[command(
    name = "thv-supervisor",
    version = version_with_build_time(),
    about = "Supervises the thv sidecar and orchestrates shutdown and updates",
    subcommand_required = false,
    arg_required_else_help = false
)]
pub struct Cli {
    /// Path to the config file (defaults to ~/.config/thv-supervisor/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Returns version string with relative build time (e.g., "0.1.0 (built 5m ago)")
fn version_with_build_time() -> &'static str {
    use std::sync::OnceLock;
    static VERSION: OnceLock<String> = OnceLock::new();

    const BUILD_TIMESTAMP_STR: &str = include_str!(concat!(env!("OUT_DIR"), "/build_timestamp.txt"));

    VERSION.get_or_init(|| {
        let version = env!("CARGO_PKG_VERSION");
        let build_timestamp: u64 = BUILD_TIMESTAMP_STR.trim().parse().unwrap_or(0);
        if build_timestamp == 0 {
            return version.to_string();
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let relative = format_relative_time(now.saturating_sub(build_timestamp));
        format!("{version} (built {relative})")
    })
}

fn format_relative_time(seconds: u64) -> String {
    match seconds {
        0..60 => format!("{seconds}s ago"),
        60..3600 => format!("{}m ago", seconds / 60),
        3600..86400 => format!("{}h ago", seconds / 3600),
        _ => format!("{}d ago", seconds / 86400),
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Start thv and supervise it until interrupted (default).",
        long_about = "Launches the thv sidecar on free ports, serves the local control API and waits for Ctrl-C, SIGTERM or a quit request. On exit every workload is stopped and recorded before thv is terminated."
    )]
    Run,
    #[command(
        about = "Stop every running workload of a thv instance and wait for them to settle.",
        long_about = "Sends one batched stop request to the thv API on the given port, then polls until every workload reports a final state or the configured timeout expires. The stopped workloads are saved so `resume` can restart them."
    )]
    StopAll(PortOpts),
    #[command(about = "Restart the workloads recorded by the last stop-all.")]
    Resume(PortOpts),
    #[command(
        about = "Print a free TCP port.",
        long_about = "With --min/--max a random free port inside the range is preferred; without them the OS picks one."
    )]
    FindPort(FindPortOpts),
    #[command(about = "Show (or clear) the workloads recorded by the last shutdown.")]
    Snapshot(SnapshotOpts),
    #[command(about = "Query a running supervisor through its control API.")]
    Status,
}

#[derive(Args, Debug, Clone)]
pub struct PortOpts {
    /// Port of the thv API.
    #[arg(long)]
    pub port: u16,
}

#[derive(Args, Debug, Clone, Default)]
pub struct FindPortOpts {
    #[arg(long, requires = "max")]
    pub min: Option<u16>,
    #[arg(long, requires = "min")]
    pub max: Option<u16>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SnapshotOpts {
    /// Delete the recorded snapshot instead of printing it.
    #[arg(long)]
    pub clear: bool,
}
