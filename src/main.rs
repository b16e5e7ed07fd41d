use anyhow::Result;
use clap::Parser;
use thv_supervisor::{
    cli::{Cli, Commands},
    commands, config, daemon, init_tracing,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cfg = match cli.config.as_deref() {
        Some(path) => config::load(path)?,
        None => config::load_or_default(config::default_config_path()),
    };

    match cli.command {
        None | Some(Commands::Run) => daemon::run(cfg).await?,
        Some(Commands::StopAll(opts)) => commands::stop_all(&cfg, opts).await?,
        Some(Commands::Resume(opts)) => commands::resume(&cfg, opts).await?,
        Some(Commands::FindPort(opts)) => commands::find_port(&cfg, opts).await?,
        Some(Commands::Snapshot(opts)) => commands::snapshot(&cfg, opts)?,
        Some(Commands::Status) => commands::status(&cfg).await?,
    }

    Ok(())
}
