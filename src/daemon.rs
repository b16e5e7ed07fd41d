//! The long-running `run` mode: wires the headless desktop stand-ins to the
//! supervisor, fleet coordinator and updater, then waits for a quit.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::{
    config::{self, Config},
    desktop::{BroadcastWindow, HeadlessWindowHost, LogTray, ProcessAppControl, Tray},
    fleet::FleetShutdown,
    instance::InstanceLock,
    lifecycle::{AppLifecycle, Teardown},
    process::TokioSpawner,
    server::{self, ControlState},
    sidecar::{ProcessSupervisor, SidecarState, StartOutcome},
    snapshot::ShutdownStore,
    telemetry::{Telemetry, TracingTelemetry},
    update::{CommandUpdater, UpdateOrchestrator},
    workloads::HttpConnector,
};

const NOTIFICATION_CAPACITY: usize = 64;
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn run(cfg: Config) -> Result<()> {
    let state_dir = config::ensure_state_dir(&cfg)?;
    let instance = InstanceLock::acquire(&state_dir)?;
    info!(lock = %instance.path().display(), "instance lock held");
    let quit = Arc::new(Notify::new());

    let window = Arc::new(BroadcastWindow::new(
        NOTIFICATION_CAPACITY,
        cfg.update.auto_restart,
    ));
    let notifications = window.sender();
    let tray = Arc::new(Tray::new(Arc::new(LogTray::new(notifications.clone()))));
    let lifecycle = Arc::new(AppLifecycle::new());
    let telemetry: Arc<dyn Telemetry> = Arc::new(TracingTelemetry);

    let supervisor = ProcessSupervisor::new(
        cfg.sidecar.clone(),
        Arc::new(TokioSpawner),
        telemetry.clone(),
        tray.clone(),
        lifecycle.clone(),
    );
    let fleet = Arc::new(FleetShutdown::new(
        Arc::new(HttpConnector::new(cfg.sidecar.host)),
        ShutdownStore::in_dir(&state_dir),
        &cfg.shutdown,
    ));
    let teardown = Arc::new(Teardown {
        supervisor: supervisor.clone(),
        fleet: fleet.clone(),
        windows: Arc::new(HeadlessWindowHost::new(window)),
        tray,
        app: Arc::new(ProcessAppControl::new(quit.clone())),
        lifecycle,
        graceful_exit_delay: cfg.update.graceful_exit_delay(),
    });

    let feed = Arc::new(CommandUpdater::new(
        cfg.update.check_command.clone(),
        cfg.update.install_command.clone(),
        quit.clone(),
    ));
    let updates =
        UpdateOrchestrator::new(feed.clone(), teardown.clone(), telemetry, &cfg.update)?;
    if cfg.update.enabled {
        updates.enable();
        if let Err(err) = updates.check_for_updates() {
            warn!(err = %format!("{err:#}"), "initial update check failed");
        }
    }

    match supervisor.start().await {
        StartOutcome::Started { pid, ports } => {
            info!(?pid, port = ports.main, mcp_port = ports.mcp, "thv running");
        }
        outcome => warn!(?outcome, "thv did not start; control server stays up"),
    }

    match fleet.last_shutdown_servers() {
        Ok(servers) if !servers.is_empty() => info!(
            count = servers.len(),
            "servers from the last shutdown can be resumed via POST /shutdown/resume"
        ),
        Ok(_) => {}
        Err(err) => warn!(err = %format!("{err:#}"), "failed to read shutdown snapshot"),
    }

    let server_stop = Arc::new(Notify::new());
    let server_task = cfg.control.enabled.then(|| {
        let addr = SocketAddr::from((cfg.control.host, cfg.control.port));
        let state = ControlState {
            supervisor: supervisor.clone(),
            fleet,
            updates: updates.clone(),
            feed: Some(feed),
            notifications,
        };
        let stop = server_stop.clone();
        tokio::spawn(async move {
            let shutdown = async move { stop.notified().await };
            if let Err(err) = server::serve(addr, state, shutdown).await {
                tracing::error!(err = %format!("{err:#}"), "control server failed");
            }
        })
    });

    tokio::select! {
        _ = shutdown_signal() => {
            let outcome = teardown.graceful_quit("signal").await;
            info!(?outcome, "teardown finished");
        }
        _ = quit.notified() => {
            info!("quit requested");
            if !teardown.lifecycle.is_tearing_down() {
                teardown.graceful_quit("quit-request").await;
            }
        }
    }

    updates.disable();
    wait_for_sidecar_exit(&supervisor, cfg.sidecar.kill_grace()).await;

    server_stop.notify_one();
    if let Some(task) = server_task {
        if tokio::time::timeout(SERVER_DRAIN_TIMEOUT, task).await.is_err() {
            warn!("control server did not drain in time");
        }
    }

    info!("supervisor exiting");
    drop(instance);
    Ok(())
}

/// Gives a terminating sidecar its grace window so the deferred kill can land.
async fn wait_for_sidecar_exit(supervisor: &ProcessSupervisor, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace + Duration::from_millis(100);
    while supervisor.state() == SidecarState::Exiting && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!(?err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::AlreadyRunning;
    use tempfile::TempDir;

    #[tokio::test]
    async fn second_daemon_refuses_to_start() {
        let dir = TempDir::new().expect("tempdir");
        let cfg = Config {
            state_dir: Some(dir.path().display().to_string()),
            ..Config::default()
        };
        let held = InstanceLock::acquire(dir.path()).expect("first instance");

        let err = run(cfg).await.expect_err("second instance must exit");
        assert!(err.downcast_ref::<AlreadyRunning>().is_some(), "{err:#}");
        assert!(held.path().exists(), "the first instance keeps its lock");
    }
}
