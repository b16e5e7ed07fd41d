//! One-shot subcommands.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::{
    cli::{FindPortOpts, PortOpts, SnapshotOpts},
    config::{self, Config},
    fleet::{FleetShutdown, ResumeOutcome, StopAllOutcome},
    ports,
    snapshot::ShutdownStore,
    workloads::HttpConnector,
};

fn fleet(cfg: &Config) -> Result<FleetShutdown> {
    let state_dir = config::ensure_state_dir(cfg)?;
    Ok(FleetShutdown::new(
        Arc::new(HttpConnector::new(cfg.sidecar.host)),
        ShutdownStore::in_dir(&state_dir),
        &cfg.shutdown,
    ))
}

pub async fn stop_all(cfg: &Config, opts: PortOpts) -> Result<()> {
    match fleet(cfg)?.stop_all_servers(opts.port).await? {
        StopAllOutcome::NothingRunning => println!("No running servers"),
        StopAllOutcome::Stopped(names) => {
            println!("Stopped {} server(s): {}", names.len(), names.join(", "));
        }
    }
    Ok(())
}

pub async fn resume(cfg: &Config, opts: PortOpts) -> Result<()> {
    match fleet(cfg)?.resume_servers(opts.port).await? {
        ResumeOutcome::NothingToResume => println!("Nothing to resume"),
        ResumeOutcome::Restarted(names) => {
            println!("Restarted {} server(s): {}", names.len(), names.join(", "));
        }
    }
    Ok(())
}

pub async fn find_port(cfg: &Config, opts: FindPortOpts) -> Result<()> {
    let range = match (opts.min, opts.max) {
        (Some(min), Some(max)) => Some(min..=max),
        _ => None,
    };
    let port = ports::find_free_port(cfg.sidecar.host, range).await?;
    println!("{port}");
    Ok(())
}

pub fn snapshot(cfg: &Config, opts: SnapshotOpts) -> Result<()> {
    let store = ShutdownStore::in_dir(&cfg.state_dir());
    if opts.clear {
        store.clear()?;
        println!("Cleared {}", store.path().display());
        return Ok(());
    }

    let servers = store.load()?;
    if servers.is_empty() {
        println!("No servers recorded at last shutdown");
        return Ok(());
    }
    for server in servers {
        match server.port {
            Some(port) => println!("{}\t{}\t:{port}", server.name, server.status),
            None => println!("{}\t{}", server.name, server.status),
        }
    }
    Ok(())
}

pub async fn status(cfg: &Config) -> Result<()> {
    let addr = SocketAddr::from((cfg.control.host, cfg.control.port));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .context("failed to build http client")?;

    let sidecar = fetch_json(&client, &format!("http://{addr}/sidecar")).await?;
    let update = fetch_json(&client, &format!("http://{addr}/update")).await?;

    println!(
        "thv:    {} (pid {}, port {}, mcp {})",
        sidecar["state"].as_str().unwrap_or("unknown"),
        display(&sidecar["pid"]),
        display(&sidecar["port"]),
        display(&sidecar["mcpPort"]),
    );
    println!("binary: {}", display(&sidecar["binaryPath"]));
    println!(
        "update: {}{}",
        update["state"].as_str().unwrap_or("unknown"),
        update["pendingVersion"]
            .as_str()
            .map(|v| format!(" ({v})"))
            .unwrap_or_default(),
    );
    Ok(())
}

async fn fetch_json(client: &reqwest::Client, url: &str) -> Result<Value> {
    client
        .get(url)
        .send()
        .await
        .with_context(|| format!("supervisor not reachable at {url}"))?
        .error_for_status()
        .with_context(|| format!("supervisor rejected {url}"))?
        .json()
        .await
        .with_context(|| format!("invalid response from {url}"))
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
