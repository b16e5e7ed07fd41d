//! Application self-update: reacting to updater events and installing.
//!
//! Installing an update has to tear the whole process tree down first, so the
//! install sequence reuses the quit path's [`Teardown`] pieces and then hands
//! over to the platform updater.

use std::{
    process::Stdio,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    process::Command,
    sync::{Notify, broadcast},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::UpdateConfig,
    desktop::{DialogChoice, Notification, UpdatePrompt, Window, ensure_window, live_window},
    lifecycle::Teardown,
    release::{LatestVersion, ReleaseFeed, current_version},
    telemetry::{Severity, Telemetry},
    termination::StopOptions,
};

pub const ALREADY_IN_PROGRESS: &str = "Update already in progress";
pub const INSTALLER_DISABLED: &str = "update installer is not enabled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateState {
    None,
    Checking,
    Downloading,
    Downloaded,
    Installing,
}

/// Events emitted by the platform updater.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpdateEvent {
    CheckingForUpdate,
    UpdateAvailable,
    UpdateNotAvailable,
    UpdateDownloaded {
        #[serde(default)]
        release: Option<String>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InstallResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Update already in progress")]
    AlreadyInProgress,
    #[error("update installation failed: {0:#}")]
    InstallFailed(anyhow::Error),
}

/// The platform's download/install machinery.
pub trait PlatformUpdater: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<UpdateEvent>;
    fn check_for_updates(&self) -> Result<()>;
    /// Applies the downloaded update and quits the application.
    fn quit_and_install(&self) -> Result<()>;
}

#[derive(Debug)]
struct UpdateSession {
    state: UpdateState,
    pending_version: Option<String>,
}

impl UpdateSession {
    fn reset(&mut self) {
        self.state = UpdateState::None;
        self.pending_version = None;
    }
}

pub struct UpdateOrchestrator {
    updater: Arc<dyn PlatformUpdater>,
    teardown: Arc<Teardown>,
    telemetry: Arc<dyn Telemetry>,
    releases: ReleaseFeed,
    check_interval: Duration,
    manual_check_interval: Duration,
    session: Mutex<UpdateSession>,
    listener: Mutex<Option<JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    installer_registered: AtomicBool,
}

impl UpdateOrchestrator {
    pub fn new(
        updater: Arc<dyn PlatformUpdater>,
        teardown: Arc<Teardown>,
        telemetry: Arc<dyn Telemetry>,
        cfg: &UpdateConfig,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            updater,
            teardown,
            telemetry,
            releases: ReleaseFeed::new(cfg.release_url.clone(), current_version())?,
            check_interval: cfg.check_interval(),
            manual_check_interval: cfg.manual_check_interval(),
            session: Mutex::new(UpdateSession {
                state: UpdateState::None,
                pending_version: None,
            }),
            listener: Mutex::new(None),
            ticker: Mutex::new(None),
            installer_registered: AtomicBool::new(false),
        }))
    }

    fn session(&self) -> MutexGuard<'_, UpdateSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> UpdateState {
        self.session().state
    }

    pub fn pending_version(&self) -> Option<String> {
        self.session().pending_version.clone()
    }

    pub fn is_update_in_progress(&self) -> bool {
        self.state() == UpdateState::Installing
    }

    pub fn is_enabled(&self) -> bool {
        self.installer_registered.load(Ordering::SeqCst)
    }

    /// Resets all update state, subscribes to the updater, registers the installer
    /// and starts the periodic check. Enabling twice replaces the previous
    /// subscription and schedule.
    pub fn enable(self: &Arc<Self>) {
        info!(interval = ?self.check_interval, "auto update enabled");
        self.activate(self.check_interval);
    }

    /// User-requested update: enables update handling even when auto update is
    /// off, checks right away and keeps checking on the shorter manual schedule.
    pub fn manual_update(self: &Arc<Self>) -> Result<bool> {
        info!(interval = ?self.manual_check_interval, "manual update requested");
        self.activate(self.manual_check_interval);
        self.check_for_updates()
    }

    fn activate(self: &Arc<Self>, period: Duration) {
        if self.is_update_in_progress() {
            info!("update install in progress; keeping update and quit state");
        } else {
            self.session().reset();
            self.teardown.lifecycle.reset();
        }

        let mut events = self.updater.subscribe();
        let orchestrator = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => orchestrator.dispatch(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "update listener lagged behind updater events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        replace_task(&self.listener, Some(task));

        let orchestrator = Arc::clone(self);
        let ticker = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(err) = orchestrator.check_for_updates() {
                    warn!(err = %format!("{err:#}"), "periodic update check failed");
                }
            }
        });
        replace_task(&self.ticker, Some(ticker));
        self.installer_registered.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        info!("auto update disabled");
        replace_task(&self.listener, None);
        replace_task(&self.ticker, None);
        self.installer_registered.store(false, Ordering::SeqCst);
        self.session().reset();
    }

    /// Asks the release feed for the newest published version.
    pub async fn latest_version(&self) -> LatestVersion {
        self.releases.latest_version().await
    }

    /// Asks the updater for a new release. Returns false when a check or
    /// download is already under way.
    pub fn check_for_updates(&self) -> Result<bool> {
        let state = self.state();
        if state != UpdateState::None {
            debug!(?state, "update flow already active; not checking");
            return Ok(false);
        }
        self.updater.check_for_updates()?;
        Ok(true)
    }

    /// Applies one updater event to the state machine.
    pub async fn dispatch(&self, event: UpdateEvent) {
        match event {
            UpdateEvent::CheckingForUpdate => {
                info!("checking for updates");
                self.session().state = UpdateState::Checking;
            }
            UpdateEvent::UpdateAvailable => {
                info!("update is available, starting download");
                self.session().state = UpdateState::Downloading;
            }
            UpdateEvent::UpdateNotAvailable => {
                let mut session = self.session();
                if session.state == UpdateState::Downloading {
                    warn!("update became unavailable during download - ignoring");
                    return;
                }
                info!("no update available");
                session.state = UpdateState::None;
            }
            UpdateEvent::UpdateDownloaded { release } => self.on_downloaded(release).await,
            UpdateEvent::Error { message } => {
                let state = {
                    let mut session = self.session();
                    let state = session.state;
                    session.state = UpdateState::None;
                    state
                };
                error!(
                    %message,
                    ?state,
                    sidecar_running = self.teardown.supervisor.is_running(),
                    "there was a problem updating the application"
                );
                self.telemetry
                    .capture(Severity::Error, &format!("auto-update error: {message}"));
            }
        }
    }

    async fn on_downloaded(&self, release: Option<String>) {
        {
            let mut session = self.session();
            if session.state == UpdateState::Installing {
                warn!("update already in progress, ignoring duplicate downloaded event");
                return;
            }
            session.pending_version = release.clone();
            session.state = UpdateState::Downloaded;
        }
        let release_name = release.clone().unwrap_or_else(|| "unknown".to_string());
        info!(release = %release_name, "update downloaded - preparing dialog");

        let window = match ensure_window(self.teardown.windows.as_ref()).await {
            Ok(window) => window,
            Err(err) => {
                error!(err = %format!("{err:#}"), "failed to prepare update dialog");
                self.notify_downloaded(None);
                return;
            }
        };

        let prompt = UpdatePrompt::for_current_platform(&release_name);
        let choice = match window.show_update_dialog(&prompt).await {
            Ok(choice) => choice,
            Err(err) => {
                error!(err = %format!("{err:#}"), "update dialog failed");
                self.notify_downloaded(Some(window));
                return;
            }
        };
        info!(?choice, release = %release_name, "user update decision");

        match choice {
            DialogChoice::Restart => {
                if let Err(err) = self.perform_installation(release).await {
                    error!(err = %err, "installation failed after recovery attempt");
                }
            }
            DialogChoice::Later => {
                self.session().state = UpdateState::None;
                info!("user deferred update installation");
                self.notify_downloaded(Some(window));
            }
        }
    }

    fn notify_downloaded(&self, window: Option<Arc<dyn Window>>) {
        let window = window
            .filter(|window| !window.is_destroyed())
            .or_else(|| live_window(self.teardown.windows.as_ref()));
        if let Some(window) = window {
            window.send(Notification::UpdateDownloaded);
        }
    }

    /// UI entry point for "restart to update".
    pub async fn install_update_and_restart(&self) -> InstallResponse {
        if !self.is_enabled() {
            return InstallResponse::failed(INSTALLER_DISABLED);
        }
        if self.is_update_in_progress() {
            warn!("update installation already in progress");
            return InstallResponse::failed(ALREADY_IN_PROGRESS);
        }

        let release = self.pending_version();
        info!(
            release = release.as_deref().unwrap_or("unknown"),
            "installing update and restarting"
        );
        match self.perform_installation(release).await {
            Ok(()) => InstallResponse::ok(),
            Err(err) => {
                error!(err = %err, "update installation failed");
                InstallResponse::failed(err.to_string())
            }
        }
    }

    async fn perform_installation(&self, release: Option<String>) -> Result<(), UpdateError> {
        {
            let mut session = self.session();
            if session.state == UpdateState::Installing {
                warn!("update installation already in progress");
                return Err(UpdateError::AlreadyInProgress);
            }
            session.state = UpdateState::Installing;
        }
        info!(
            release = release.as_deref().unwrap_or("unknown"),
            "installing update"
        );

        match self.run_install_steps().await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(err = %format!("{err:#}"), "error during update installation");
                self.telemetry.capture(
                    Severity::Error,
                    &format!("update installation failed: {err:#}"),
                );
                self.session().state = UpdateState::None;
                self.recover();
                Err(UpdateError::InstallFailed(err))
            }
        }
    }

    async fn run_install_steps(&self) -> Result<()> {
        let teardown = &self.teardown;
        teardown.lifecycle.detach_quit_guards();
        teardown.lifecycle.set_quitting(true);
        teardown.lifecycle.set_tearing_down(true);

        info!("starting graceful shutdown before update");
        teardown.notify_graceful_exit().await;

        if !teardown.stop_fleet("update").await {
            warn!("server shutdown failed, proceeding with update anyway");
        }

        let outcome = teardown.supervisor.stop(StopOptions::graceful());
        info!(?outcome, "thv stopped");

        teardown.tray.safe_destroy();

        info!("all cleaned up; handing over to the platform installer");
        self.updater
            .quit_and_install()
            .context("platform installer failed")
    }

    fn recover(&self) {
        let teardown = &self.teardown;
        teardown.tray.safe_destroy();
        info!("attempting app relaunch after update failure");
        let recovered = teardown.app.relaunch().and_then(|()| teardown.app.quit());
        if let Err(err) = recovered {
            error!(err = %format!("{err:#}"), "update recovery failed");
            teardown.app.exit(1);
        }
    }
}

fn replace_task(slot: &Mutex<Option<JoinHandle<()>>>, task: Option<JoinHandle<()>>) {
    let previous = std::mem::replace(
        &mut *slot.lock().unwrap_or_else(PoisonError::into_inner),
        task,
    );
    if let Some(previous) = previous {
        previous.abort();
    }
}

/// Headless updater driven by shell commands and by events posted to the control server.
pub struct CommandUpdater {
    events: broadcast::Sender<UpdateEvent>,
    check_command: Option<String>,
    install_command: Option<String>,
    quit: Arc<Notify>,
}

impl CommandUpdater {
    pub fn new(
        check_command: Option<String>,
        install_command: Option<String>,
        quit: Arc<Notify>,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            events,
            check_command,
            install_command,
            quit,
        }
    }

    /// Feeds an event from an out-of-process updater.
    pub fn publish(&self, event: UpdateEvent) {
        debug!(?event, "publishing update event");
        let _ = self.events.send(event);
    }
}

impl PlatformUpdater for CommandUpdater {
    fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    /// Runs the check command in the background. Its first output line names the
    /// downloaded release; no output means no update.
    fn check_for_updates(&self) -> Result<()> {
        let Some(command) = self.check_command.clone() else {
            bail!("no update check command configured");
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = events.send(UpdateEvent::CheckingForUpdate);
            let event = match run_shell(&command).await {
                Ok(stdout) => match stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
                    Some(release) => {
                        let _ = events.send(UpdateEvent::UpdateAvailable);
                        UpdateEvent::UpdateDownloaded {
                            release: Some(release.to_string()),
                        }
                    }
                    None => UpdateEvent::UpdateNotAvailable,
                },
                Err(err) => UpdateEvent::Error {
                    message: format!("{err:#}"),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    fn quit_and_install(&self) -> Result<()> {
        let command = self
            .install_command
            .as_deref()
            .ok_or_else(|| anyhow!("no update install command configured"))?;
        shell_command(command)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to launch installer `{command}`"))?;
        info!(command, "installer launched; quitting");
        self.quit.notify_one();
        Ok(())
    }
}

fn shell_command(command: &str) -> std::process::Command {
    if cfg!(windows) {
        let mut cmd = std::process::Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = std::process::Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

async fn run_shell(command: &str) -> Result<String> {
    let output = Command::from(shell_command(command))
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to run `{command}`"))?;
    if !output.status.success() {
        bail!("`{command}` exited with status {}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
