pub mod binary;
pub mod cli;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod desktop;
pub mod fleet;
pub mod instance;
pub mod lifecycle;
pub mod ports;
pub mod process;
pub mod release;
pub mod server;
pub mod sidecar;
pub mod snapshot;
pub mod telemetry;
pub mod termination;
pub mod update;
pub mod workloads;

#[cfg(test)]
pub(crate) mod test_support;

/// Initialize tracing with a default filter if `RUST_LOG` is unset.
pub fn init_tracing() {
    let default_filter = "thv_supervisor=info,thv=info,axum=warn,tower=warn";
    let filter_layer = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .compact()
        .init();
}
