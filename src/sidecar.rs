//! Supervision of the single `thv` sidecar process.

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{debug, error, info, warn};

use crate::{
    binary::{read_binary_version, resolve_binary_path},
    config::SidecarConfig,
    desktop::Tray,
    lifecycle::AppLifecycle,
    ports::{SidecarPorts, allocate_sidecar_ports},
    process::{ProcessEvent, SidecarHandle, SpawnRequest, Spawner, StderrReader},
    telemetry::{Severity, Telemetry},
    termination::{StopOptions, StopOutcome, TerminationController},
};

/// Stderr lines containing this are the sidecar nagging about its own updates.
const SUPPRESSED_STDERR: &str = "new version available";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SidecarState {
    NotStarted,
    Starting,
    Running,
    Restarting,
    /// Stopped, but the old process has not exited yet.
    Exiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: Option<u32>, ports: SidecarPorts },
    BinaryMissing,
    AlreadyRunning,
    SpawnFailed,
    /// The app is quitting; no new process is launched.
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    AlreadyRestarting,
    ShuttingDown,
    Completed {
        stop: StopOutcome,
        start: StartOutcome,
    },
}

/// Why a sidecar process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// We signalled it.
    Requested,
    /// The app was quitting or restarting the sidecar.
    Expected,
    /// A crash.
    Unexpected,
}

/// Identity of one spawned process, passed along with its lifetime events.
#[derive(Debug, Clone)]
pub struct ProcessRef {
    pub generation: u64,
    pub handle: Arc<dyn SidecarHandle>,
}

struct Inner {
    process: Option<Arc<dyn SidecarHandle>>,
    generation: u64,
    ports: Option<SidecarPorts>,
    state: SidecarState,
    binary_path: PathBuf,
    version: Option<String>,
}

pub struct ProcessSupervisor {
    config: SidecarConfig,
    spawner: Arc<dyn Spawner>,
    telemetry: Arc<dyn Telemetry>,
    tray: Arc<Tray>,
    lifecycle: Arc<AppLifecycle>,
    termination: TerminationController,
    restarting: Arc<AtomicBool>,
    next_generation: AtomicU64,
    inner: Mutex<Inner>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SidecarConfig,
        spawner: Arc<dyn Spawner>,
        telemetry: Arc<dyn Telemetry>,
        tray: Arc<Tray>,
        lifecycle: Arc<AppLifecycle>,
    ) -> Arc<Self> {
        let binary_path = resolve_binary_path(&config);
        let termination = TerminationController::new(config.kill_grace());
        Arc::new(Self {
            config,
            spawner,
            telemetry,
            tray,
            lifecycle,
            termination,
            restarting: Arc::new(AtomicBool::new(false)),
            next_generation: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                process: None,
                generation: 0,
                ports: None,
                state: SidecarState::NotStarted,
                binary_path,
                version: None,
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.inner()
            .process
            .as_ref()
            .is_some_and(|handle| !handle.has_exited())
    }

    /// Main API port of the running sidecar.
    pub fn port(&self) -> Option<u16> {
        self.inner().ports.map(|ports| ports.main)
    }

    pub fn mcp_port(&self) -> Option<u16> {
        self.inner().ports.map(|ports| ports.mcp)
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner().process.as_ref().and_then(|handle| handle.pid())
    }

    pub fn state(&self) -> SidecarState {
        let state = self.inner().state;
        if state == SidecarState::NotStarted && self.termination.has_pending_kill() {
            SidecarState::Exiting
        } else {
            state
        }
    }

    pub fn binary_path(&self) -> PathBuf {
        self.inner().binary_path.clone()
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    /// Version string reported by the current binary, cached until the next `start`.
    pub async fn binary_version(&self) -> Option<String> {
        let binary = {
            let inner = self.inner();
            if let Some(version) = &inner.version {
                return Some(version.clone());
            }
            inner.binary_path.clone()
        };

        match read_binary_version(&binary).await {
            Ok(version) => {
                let mut inner = self.inner();
                if inner.binary_path == binary {
                    inner.version = Some(version.clone());
                }
                Some(version)
            }
            Err(err) => {
                debug!(err = %format!("{err:#}"), "could not read thv version");
                None
            }
        }
    }

    pub async fn start(self: &Arc<Self>) -> StartOutcome {
        if self.shutting_down() {
            info!("app is shutting down; not starting thv");
            return StartOutcome::ShuttingDown;
        }

        let binary = resolve_binary_path(&self.config);
        {
            let mut inner = self.inner();
            inner.binary_path = binary.clone();
            inner.version = None;
        }

        if !binary.exists() {
            error!(path = %binary.display(), "thv binary not found at {}", binary.display());
            self.tray.update_status(false);
            return StartOutcome::BinaryMissing;
        }

        {
            let mut inner = self.inner();
            let live = inner
                .process
                .as_ref()
                .is_some_and(|handle| !handle.has_exited());
            if live || inner.state == SidecarState::Starting {
                info!("thv is already running; not starting a second instance");
                return StartOutcome::AlreadyRunning;
            }
            inner.state = SidecarState::Starting;
        }

        let ports = match allocate_sidecar_ports(self.config.host, self.config.port_range()).await
        {
            Ok(ports) => ports,
            Err(err) => {
                error!(err = %format!("{err:#}"), "failed to allocate sidecar ports");
                self.telemetry
                    .capture(Severity::Fatal, &format!("failed to allocate thv ports: {err:#}"));
                self.settle_not_running();
                return StartOutcome::SpawnFailed;
            }
        };

        if self.shutting_down() {
            info!("app began shutting down while thv was starting; not spawning");
            let mut inner = self.inner();
            if inner.state == SidecarState::Starting {
                inner.state = SidecarState::NotStarted;
            }
            return StartOutcome::ShuttingDown;
        }

        let request = SpawnRequest {
            binary: binary.clone(),
            args: sidecar_args(self.config.host, ports),
        };
        info!(
            path = %binary.display(),
            port = ports.main,
            mcp_port = ports.mcp,
            "starting thv"
        );

        let spawned = match self.spawner.spawn(&request) {
            Ok(spawned) => spawned,
            Err(err) => {
                error!(path = %binary.display(), ?err, "failed to start thv");
                self.telemetry
                    .capture(Severity::Fatal, &format!("failed to start thv: {err}"));
                self.settle_not_running();
                return StartOutcome::SpawnFailed;
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let handle = spawned.handle;
        let pid = handle.pid();
        {
            let mut inner = self.inner();
            inner.process = Some(Arc::clone(&handle));
            inner.generation = generation;
            inner.ports = Some(ports);
            inner.state = SidecarState::Running;
        }
        info!(?pid, generation, "thv process spawned");
        self.tray.update_status(true);

        if let Some(stderr) = spawned.stderr {
            spawn_stderr_task(stderr);
        }
        self.spawn_event_task(ProcessRef { generation, handle }, spawned.events);

        StartOutcome::Started { pid, ports }
    }

    /// Stops the sidecar. The slot is cleared immediately; a graceful stop
    /// escalates to SIGKILL if the process outlives the grace window.
    pub fn stop(&self, options: StopOptions) -> StopOutcome {
        let outcome = {
            let mut inner = self.inner();
            let outcome = self.termination.stop(&mut inner.process, options);
            inner.ports = None;
            inner.state = if self.is_restarting() {
                SidecarState::Restarting
            } else {
                SidecarState::NotStarted
            };
            outcome
        };
        if outcome != StopOutcome::NoProcess {
            info!(?outcome, "thv process stopped and reset");
            self.tray.update_status(false);
        }
        outcome
    }

    /// Stops and starts the sidecar. Further restarts are refused until the
    /// cool-down after this one has elapsed.
    pub async fn restart(self: &Arc<Self>) -> RestartOutcome {
        if self.shutting_down() {
            info!("app is shutting down; ignoring restart");
            return RestartOutcome::ShuttingDown;
        }
        if self.restarting.swap(true, Ordering::SeqCst) {
            info!("restart already in progress, skipping");
            return RestartOutcome::AlreadyRestarting;
        }

        info!("restarting thv");
        self.inner().state = SidecarState::Restarting;

        let stop = self.stop(StopOptions::graceful());
        let start = self.start().await;
        match start {
            StartOutcome::Started { .. } => info!("thv restarted successfully"),
            other => {
                self.settle_after_failed_restart();
                error!(outcome = ?other, "failed to restart thv");
                self.telemetry
                    .capture(Severity::Error, &format!("failed to restart thv: {other:?}"));
            }
        }

        self.arm_restart_cooldown();
        RestartOutcome::Completed { stop, start }
    }

    fn shutting_down(&self) -> bool {
        self.lifecycle.is_quitting() || self.lifecycle.is_tearing_down()
    }

    fn arm_restart_cooldown(&self) {
        let restarting = Arc::clone(&self.restarting);
        let cooldown = self.config.restart_cooldown();
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            restarting.store(false, Ordering::SeqCst);
            debug!("restart cool-down elapsed");
        });
    }

    /// Applies one lifetime event. Events from a process that is no longer
    /// current are logged but never touch the slot.
    pub fn handle_process_event(&self, source: &ProcessRef, event: ProcessEvent) -> Option<ExitKind> {
        match event {
            ProcessEvent::Error { message } => {
                error!(generation = source.generation, %message, "thv process error");
                self.telemetry
                    .capture(Severity::Fatal, &format!("failed to start thv: {message}"));
                self.clear_if_current(source.generation);
                None
            }
            ProcessEvent::Exited { code } => {
                let kind = self.classify_exit(source);
                warn!(
                    generation = source.generation,
                    ?code,
                    ?kind,
                    "thv process exited with code {}",
                    code.map_or_else(|| "none".to_string(), |c| c.to_string())
                );
                self.clear_if_current(source.generation);

                if kind == ExitKind::Unexpected {
                    let code = code.map_or_else(|| "none".to_string(), |c| c.to_string());
                    self.telemetry.capture(
                        Severity::Fatal,
                        &format!("thv exited unexpectedly with code {code}"),
                    );
                }
                Some(kind)
            }
        }
    }

    fn classify_exit(&self, source: &ProcessRef) -> ExitKind {
        if source.handle.stop_requested() {
            ExitKind::Requested
        } else if self.lifecycle.is_quitting() || self.is_restarting() {
            ExitKind::Expected
        } else {
            ExitKind::Unexpected
        }
    }

    fn clear_if_current(&self, generation: u64) {
        let cleared = {
            let mut inner = self.inner();
            if inner.generation != generation || inner.process.is_none() {
                false
            } else {
                inner.process = None;
                inner.ports = None;
                if inner.state == SidecarState::Running {
                    inner.state = SidecarState::NotStarted;
                }
                true
            }
        };
        if cleared {
            self.tray.update_status(false);
        } else {
            debug!(generation, "ignoring event from a replaced thv process");
        }
    }

    fn settle_not_running(&self) {
        {
            let mut inner = self.inner();
            if inner.state == SidecarState::Starting {
                inner.state = SidecarState::NotStarted;
            }
        }
        self.tray.update_status(false);
    }

    fn settle_after_failed_restart(&self) {
        let mut inner = self.inner();
        if inner.state == SidecarState::Restarting {
            let live = inner
                .process
                .as_ref()
                .is_some_and(|handle| !handle.has_exited());
            inner.state = if live {
                SidecarState::Running
            } else {
                SidecarState::NotStarted
            };
        }
    }

    fn spawn_event_task(
        self: &Arc<Self>,
        source: ProcessRef,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    ) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                supervisor.handle_process_event(&source, event);
            }
        });
    }
}

/// `serve` arguments for one sidecar instance.
pub fn sidecar_args(host: std::net::IpAddr, ports: SidecarPorts) -> Vec<String> {
    vec![
        "serve".to_string(),
        "--openapi".to_string(),
        "--experimental-mcp".to_string(),
        format!("--experimental-mcp-host={host}"),
        format!("--experimental-mcp-port={}", ports.mcp),
        format!("--host={host}"),
        format!("--port={}", ports.main),
    ]
}

fn should_forward(line: &str) -> bool {
    !line.to_ascii_lowercase().contains(SUPPRESSED_STDERR)
}

fn spawn_stderr_task(stderr: StderrReader) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if should_forward(&line) {
                info!(target: "thv", "{line}");
            }
        }
    });
}
