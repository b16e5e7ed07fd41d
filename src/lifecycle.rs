//! Application-wide quit state and the graceful teardown shared by quit and update.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tracing::{error, info, warn};

use crate::{
    desktop::{AppControl, Notification, Tray, WindowHost, ensure_window, live_window},
    fleet::{FleetShutdown, StopAllOutcome},
    sidecar::ProcessSupervisor,
    termination::StopOptions,
};

/// Process-wide quit flags.
#[derive(Debug)]
pub struct AppLifecycle {
    quitting: AtomicBool,
    tearing_down: AtomicBool,
    quit_guards_attached: AtomicBool,
}

impl Default for AppLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl AppLifecycle {
    pub fn new() -> Self {
        Self {
            quitting: AtomicBool::new(false),
            tearing_down: AtomicBool::new(false),
            quit_guards_attached: AtomicBool::new(true),
        }
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    pub fn set_quitting(&self, quitting: bool) {
        self.quitting.store(quitting, Ordering::SeqCst);
    }

    pub fn is_tearing_down(&self) -> bool {
        self.tearing_down.load(Ordering::SeqCst)
    }

    pub fn set_tearing_down(&self, tearing_down: bool) {
        self.tearing_down.store(tearing_down, Ordering::SeqCst);
    }

    /// Marks teardown as started. Returns false if it already was.
    pub fn begin_teardown(&self) -> bool {
        !self.tearing_down.swap(true, Ordering::SeqCst)
    }

    /// Whether quit requests should run [`Teardown::graceful_quit`].
    pub fn quit_guards_attached(&self) -> bool {
        self.quit_guards_attached.load(Ordering::SeqCst)
    }

    /// Stops quit requests from triggering a teardown, so an installer can quit the app itself.
    pub fn detach_quit_guards(&self) {
        if self.quit_guards_attached.swap(false, Ordering::SeqCst) {
            info!("quit guards detached");
        }
    }

    pub fn reset(&self) {
        self.set_quitting(false);
        self.set_tearing_down(false);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitOutcome {
    AlreadyTearingDown,
    /// Quit guards were detached; the quit goes straight through.
    Bypassed,
    Completed,
}

/// Everything a teardown touches.
pub struct Teardown {
    pub supervisor: Arc<ProcessSupervisor>,
    pub fleet: Arc<FleetShutdown>,
    pub windows: Arc<dyn WindowHost>,
    pub tray: Arc<Tray>,
    pub app: Arc<dyn AppControl>,
    pub lifecycle: Arc<AppLifecycle>,
    pub graceful_exit_delay: Duration,
}

impl Teardown {
    /// Quit path: tell the UI, stop the fleet, stop the sidecar, drop the tray, quit.
    ///
    /// Failures along the way are logged and never keep the app from quitting.
    pub async fn graceful_quit(&self, source: &str) -> QuitOutcome {
        if !self.lifecycle.quit_guards_attached() {
            info!(source, "quit guards detached; quitting directly");
            self.quit();
            return QuitOutcome::Bypassed;
        }
        if !self.lifecycle.begin_teardown() {
            info!(source, "teardown already in progress");
            return QuitOutcome::AlreadyTearingDown;
        }
        self.lifecycle.set_quitting(true);
        info!(source, "initiating graceful teardown");

        match ensure_window(self.windows.as_ref()).await {
            Ok(window) => {
                window.show();
                window.send(Notification::GracefulExit);
                tokio::time::sleep(self.graceful_exit_delay).await;
            }
            Err(err) => {
                error!(err = %format!("{err:#}"), "failed to send graceful-exit message");
            }
        }

        if !self.stop_fleet(source).await {
            warn!(source, "teardown continuing after fleet shutdown failure");
        }

        let outcome = self.supervisor.stop(StopOptions::graceful());
        info!(source, ?outcome, "thv stopped");

        self.tray.safe_destroy();
        self.quit();
        QuitOutcome::Completed
    }

    /// Sends `GracefulExit` to a live window only and gives the renderer time to react.
    pub async fn notify_graceful_exit(&self) {
        if let Some(window) = live_window(self.windows.as_ref()) {
            window.send(Notification::GracefulExit);
            tokio::time::sleep(self.graceful_exit_delay).await;
        }
    }

    /// Stops every workload if the sidecar port is known. Returns false on failure.
    pub async fn stop_fleet(&self, source: &str) -> bool {
        let Some(port) = self.supervisor.port() else {
            info!(source, "no thv port available; skipping server shutdown");
            return true;
        };

        match self.fleet.stop_all_servers(port).await {
            Ok(StopAllOutcome::NothingRunning) => true,
            Ok(StopAllOutcome::Stopped(servers)) => {
                info!(source, count = servers.len(), "all servers stopped");
                if let Some(window) = live_window(self.windows.as_ref()) {
                    window.send(Notification::ServerShutdown { servers });
                }
                true
            }
            Err(err) => {
                error!(source, err = %err, "server shutdown failed");
                false
            }
        }
    }

    fn quit(&self) {
        if let Err(err) = self.app.quit() {
            error!(err = %format!("{err:#}"), "failed to quit application");
        }
    }
}
