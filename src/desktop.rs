//! Boundary to the UI layer: window, tray and application control.
//!
//! The supervisor never draws anything itself. The embedding application
//! implements these traits; the headless implementations below forward
//! notifications to the control server's event stream instead.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};

/// Messages pushed to the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    /// The app is about to tear everything down; show the shutdown page.
    GracefulExit,
    /// An update is ready; show the "restart to update" toast.
    UpdateDownloaded,
    TrayStatusChanged { running: bool },
    /// These workloads were stopped by a teardown.
    ServerShutdown { servers: Vec<String> },
}

impl Notification {
    pub fn event_name(&self) -> &'static str {
        match self {
            Notification::GracefulExit => "graceful-exit",
            Notification::UpdateDownloaded => "update-downloaded",
            Notification::TrayStatusChanged { .. } => "tray-status-changed",
            Notification::ServerShutdown { .. } => "server-shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogChoice {
    Restart,
    Later,
}

/// Copy for the "update downloaded" dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdatePrompt {
    pub title: String,
    pub message: String,
    pub detail: String,
    pub buttons: [&'static str; 2],
}

const UPDATE_READY_TEXT: &str =
    "A new version has been downloaded.\nThe update will be applied on the next application restart.";

impl UpdatePrompt {
    /// macOS puts the release name in the message and the explanation in the detail; other
    /// platforms swap them.
    pub fn for_release(release: &str, macos: bool) -> Self {
        let title = format!("Release {release}");
        let (message, detail) = if macos {
            (title.clone(), UPDATE_READY_TEXT.to_string())
        } else {
            (
                UPDATE_READY_TEXT.to_string(),
                format!("Ready to install {release}"),
            )
        };
        Self {
            title,
            message,
            detail,
            buttons: ["Restart", "Later"],
        }
    }

    pub fn for_current_platform(release: &str) -> Self {
        Self::for_release(release, cfg!(target_os = "macos"))
    }
}

pub trait Window: Send + Sync {
    fn is_destroyed(&self) -> bool;
    fn is_minimized(&self) -> bool;
    fn restore(&self);
    fn show(&self);
    fn send(&self, notification: Notification);

    /// Resolves once the renderer can receive notifications.
    fn wait_until_ready(&self) -> BoxFuture<'_, Result<()>>;

    fn show_update_dialog<'a>(
        &'a self,
        prompt: &'a UpdatePrompt,
    ) -> BoxFuture<'a, Result<DialogChoice>>;
}

pub trait WindowHost: Send + Sync {
    fn main_window(&self) -> Option<Arc<dyn Window>>;

    /// Creates a new main window, replacing a destroyed one.
    fn recreate_main_window(&self) -> BoxFuture<'_, Result<Arc<dyn Window>>>;
}

/// The main window if it exists and has not been destroyed.
pub fn live_window(host: &dyn WindowHost) -> Option<Arc<dyn Window>> {
    host.main_window().filter(|window| !window.is_destroyed())
}

/// Returns a ready, restored main window, recreating it when necessary.
pub async fn ensure_window(host: &dyn WindowHost) -> Result<Arc<dyn Window>> {
    let window = match live_window(host) {
        Some(window) => window,
        None => {
            info!("main window not available; recreating");
            let window = host
                .recreate_main_window()
                .await
                .context("failed to recreate main window")?;
            window
                .wait_until_ready()
                .await
                .context("recreated window never became ready")?;
            window
        }
    };

    if window.is_minimized() && !window.is_destroyed() {
        window.restore();
    }
    Ok(window)
}

pub trait TrayIcon: Send + Sync {
    fn set_running(&self, running: bool);
    fn destroy(&self);
}

/// Tray wrapper that tolerates a missing icon and repeated destroys.
pub struct Tray {
    icon: Option<Arc<dyn TrayIcon>>,
    destroyed: AtomicBool,
}

impl Tray {
    pub fn new(icon: Arc<dyn TrayIcon>) -> Self {
        Self {
            icon: Some(icon),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn none() -> Self {
        Self {
            icon: None,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn update_status(&self, running: bool) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(icon) = &self.icon {
            icon.set_running(running);
        }
    }

    /// Destroys the icon once; later calls are no-ops.
    pub fn safe_destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            debug!("tray already destroyed");
            return;
        }
        if let Some(icon) = &self.icon {
            icon.destroy();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Relaunch and quit primitives of the host application.
pub trait AppControl: Send + Sync {
    fn relaunch(&self) -> Result<()>;
    fn quit(&self) -> Result<()>;
    /// Terminates the process immediately. Only used when update recovery itself failed.
    fn exit(&self, code: i32);
}

/// Headless "window" that forwards notifications to a broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastWindow {
    events: broadcast::Sender<Notification>,
    auto_restart: bool,
}

impl BroadcastWindow {
    pub fn new(capacity: usize, auto_restart: bool) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            events,
            auto_restart,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<Notification> {
        self.events.clone()
    }
}

impl Window for BroadcastWindow {
    fn is_destroyed(&self) -> bool {
        false
    }

    fn is_minimized(&self) -> bool {
        false
    }

    fn restore(&self) {}

    fn show(&self) {}

    fn send(&self, notification: Notification) {
        debug!(event = notification.event_name(), "notifying ui");
        // no subscribers is fine
        let _ = self.events.send(notification);
    }

    fn wait_until_ready(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn show_update_dialog<'a>(
        &'a self,
        prompt: &'a UpdatePrompt,
    ) -> BoxFuture<'a, Result<DialogChoice>> {
        Box::pin(async move {
            let choice = if self.auto_restart {
                DialogChoice::Restart
            } else {
                DialogChoice::Later
            };
            info!(title = %prompt.title, ?choice, "answering update dialog headlessly");
            Ok(choice)
        })
    }
}

/// Window host whose single window never goes away.
#[derive(Clone)]
pub struct HeadlessWindowHost {
    window: Arc<BroadcastWindow>,
}

impl HeadlessWindowHost {
    pub fn new(window: Arc<BroadcastWindow>) -> Self {
        Self { window }
    }
}

impl WindowHost for HeadlessWindowHost {
    fn main_window(&self) -> Option<Arc<dyn Window>> {
        Some(self.window.clone() as Arc<dyn Window>)
    }

    fn recreate_main_window(&self) -> BoxFuture<'_, Result<Arc<dyn Window>>> {
        Box::pin(async move { Ok(self.window.clone() as Arc<dyn Window>) })
    }
}

/// Tray stand-in that logs status changes and publishes them to the event stream.
pub struct LogTray {
    events: broadcast::Sender<Notification>,
}

impl LogTray {
    pub fn new(events: broadcast::Sender<Notification>) -> Self {
        Self { events }
    }
}

impl TrayIcon for LogTray {
    fn set_running(&self, running: bool) {
        info!(running, "sidecar status changed");
        let _ = self
            .events
            .send(Notification::TrayStatusChanged { running });
    }

    fn destroy(&self) {
        debug!("tray destroyed");
    }
}

/// Quits by waking the main loop; relaunches by re-executing the current binary.
pub struct ProcessAppControl {
    quit: Arc<Notify>,
}

impl ProcessAppControl {
    pub fn new(quit: Arc<Notify>) -> Self {
        Self { quit }
    }
}

impl AppControl for ProcessAppControl {
    fn relaunch(&self) -> Result<()> {
        let exe = std::env::current_exe().context("failed to locate current executable")?;
        let args: Vec<String> = std::env::args().skip(1).collect();
        std::process::Command::new(&exe)
            .args(&args)
            .spawn()
            .with_context(|| format!("failed to relaunch {}", exe.display()))?;
        info!(exe = %exe.display(), "relaunched supervisor");
        Ok(())
    }

    fn quit(&self) -> Result<()> {
        self.quit.notify_one();
        Ok(())
    }

    fn exit(&self, code: i32) {
        warn!(code, "exiting immediately");
        std::process::exit(code);
    }
}
