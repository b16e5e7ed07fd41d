//! Fakes shared by the unit tests.

use std::{
    collections::VecDeque,
    fs, io,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use futures::future::BoxFuture;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

use crate::{
    binary::embedded_binary_path,
    config::{ShutdownConfig, SidecarConfig},
    desktop::{
        AppControl, DialogChoice, Notification, Tray, TrayIcon, UpdatePrompt, Window, WindowHost,
    },
    fleet::FleetShutdown,
    lifecycle::{AppLifecycle, Teardown},
    process::{ProcessEvent, SidecarHandle, Signal, SpawnRequest, SpawnedSidecar, Spawner},
    sidecar::{ProcessSupervisor, StartOutcome},
    snapshot::ShutdownStore,
    telemetry::{Severity, Telemetry},
    update::{PlatformUpdater, UpdateEvent},
    workloads::{Workload, WorkloadApi, WorkloadConnector, WorkloadStatus},
};

/// Collects formatted log lines so tests can assert on what was logged.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Routes this thread's tracing output into the capture until the guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeHandle {
    pid: u32,
    exited: AtomicBool,
    stop_requested: AtomicBool,
    fail_sigterm: AtomicBool,
    signals: Mutex<Vec<Signal>>,
}

impl FakeHandle {
    pub fn new(pid: u32) -> Arc<Self> {
        Arc::new(Self {
            pid,
            exited: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            fail_sigterm: AtomicBool::new(false),
            signals: Mutex::new(Vec::new()),
        })
    }

    /// Signals that were delivered successfully, in order.
    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }

    pub fn exit(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    pub fn fail_sigterm(&self) {
        self.fail_sigterm.store(true, Ordering::SeqCst);
    }
}

impl SidecarHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn signal(&self, signal: Signal) -> io::Result<()> {
        if signal == Signal::Term && self.fail_sigterm.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        self.signals.lock().unwrap().push(signal);
        Ok(())
    }

    fn mark_stop_requested(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

/// Hands out [`FakeHandle`]s with pids 1000, 1001, ...
#[derive(Default)]
pub struct FakeSpawner {
    requests: Mutex<Vec<SpawnRequest>>,
    handles: Mutex<Vec<Arc<FakeHandle>>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<ProcessEvent>>>,
    fail_next: AtomicBool,
}

impl FakeSpawner {
    pub fn requests(&self) -> Vec<SpawnRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn handle(&self, index: usize) -> Arc<FakeHandle> {
        Arc::clone(&self.handles.lock().unwrap()[index])
    }

    pub fn fail_next_spawn(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Delivers `event` for the `index`-th spawned process, marking it exited first.
    pub fn emit(&self, index: usize, event: ProcessEvent) {
        self.handle(index).exit();
        let _ = self.senders.lock().unwrap()[index].send(event);
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedSidecar> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }

        let mut handles = self.handles.lock().unwrap();
        let pid = 1000 + handles.len() as u32;
        let handle = FakeHandle::new(pid);
        handles.push(Arc::clone(&handle));

        let (tx, events) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);

        Ok(SpawnedSidecar {
            handle,
            stderr: None,
            events,
        })
    }
}

/// Sidecar config whose embedded binary exists under `dir`.
pub fn sidecar_config_with_binary(dir: &Path) -> SidecarConfig {
    let binary = embedded_binary_path(dir);
    if let Some(parent) = binary.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&binary, "").unwrap();
    SidecarConfig {
        resources_dir: dir.display().to_string(),
        ..SidecarConfig::default()
    }
}

#[derive(Default)]
pub struct RecordingTelemetry {
    captured: Mutex<Vec<(Severity, String)>>,
}

impl RecordingTelemetry {
    pub fn captured(&self) -> Vec<(Severity, String)> {
        self.captured.lock().unwrap().clone()
    }

    pub fn has_fatal_containing(&self, needle: &str) -> bool {
        self.captured()
            .iter()
            .any(|(severity, message)| *severity == Severity::Fatal && message.contains(needle))
    }
}

impl Telemetry for RecordingTelemetry {
    fn capture(&self, severity: Severity, message: &str) {
        self.captured
            .lock()
            .unwrap()
            .push((severity, message.to_string()));
    }
}

#[derive(Default)]
pub struct FakeTrayIcon {
    statuses: Mutex<Vec<bool>>,
    destroyed: AtomicUsize,
}

impl FakeTrayIcon {
    pub fn statuses(&self) -> Vec<bool> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn destroy_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl TrayIcon for FakeTrayIcon {
    fn set_running(&self, running: bool) {
        self.statuses.lock().unwrap().push(running);
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeWindow {
    destroyed: AtomicBool,
    minimized: AtomicBool,
    ready_awaited: AtomicBool,
    sent: Mutex<Vec<Notification>>,
    prompts: Mutex<Vec<UpdatePrompt>>,
    dialog_answer: Mutex<Option<Result<DialogChoice, String>>>,
}

impl FakeWindow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub fn minimize(&self) {
        self.minimized.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<UpdatePrompt> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn was_ready_awaited(&self) -> bool {
        self.ready_awaited.load(Ordering::SeqCst)
    }

    /// Answer for the next update dialog. Unanswered dialogs pick "Later".
    pub fn answer_dialog(&self, answer: Result<DialogChoice, String>) {
        *self.dialog_answer.lock().unwrap() = Some(answer);
    }
}

impl Window for FakeWindow {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn is_minimized(&self) -> bool {
        self.minimized.load(Ordering::SeqCst)
    }

    fn restore(&self) {
        self.minimized.store(false, Ordering::SeqCst);
    }

    fn show(&self) {}

    fn send(&self, notification: Notification) {
        self.sent.lock().unwrap().push(notification);
    }

    fn wait_until_ready(&self) -> BoxFuture<'_, Result<()>> {
        self.ready_awaited.store(true, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn show_update_dialog<'a>(
        &'a self,
        prompt: &'a UpdatePrompt,
    ) -> BoxFuture<'a, Result<DialogChoice>> {
        self.prompts.lock().unwrap().push(prompt.clone());
        let answer = self
            .dialog_answer
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Ok(DialogChoice::Later));
        Box::pin(async move { answer.map_err(|err| anyhow!(err)) })
    }
}

pub struct FakeWindowHost {
    main: Mutex<Option<Arc<FakeWindow>>>,
    fresh: Arc<FakeWindow>,
    recreated: AtomicUsize,
}

impl FakeWindowHost {
    /// `fresh` is what a recreate returns.
    pub fn new(main: Option<Arc<FakeWindow>>, fresh: Arc<FakeWindow>) -> Self {
        Self {
            main: Mutex::new(main),
            fresh,
            recreated: AtomicUsize::new(0),
        }
    }

    pub fn recreate_count(&self) -> usize {
        self.recreated.load(Ordering::SeqCst)
    }

    pub fn fresh(&self) -> Arc<FakeWindow> {
        Arc::clone(&self.fresh)
    }
}

impl WindowHost for FakeWindowHost {
    fn main_window(&self) -> Option<Arc<dyn Window>> {
        self.main
            .lock()
            .unwrap()
            .clone()
            .map(|window| window as Arc<dyn Window>)
    }

    fn recreate_main_window(&self) -> BoxFuture<'_, Result<Arc<dyn Window>>> {
        self.recreated.fetch_add(1, Ordering::SeqCst);
        *self.main.lock().unwrap() = Some(Arc::clone(&self.fresh));
        let window = Arc::clone(&self.fresh) as Arc<dyn Window>;
        Box::pin(async move { Ok(window) })
    }
}

#[derive(Default)]
pub struct FakeAppControl {
    relaunched: AtomicUsize,
    quit: AtomicUsize,
    exits: Mutex<Vec<i32>>,
    fail_relaunch: AtomicBool,
}

impl FakeAppControl {
    pub fn relaunch_count(&self) -> usize {
        self.relaunched.load(Ordering::SeqCst)
    }

    pub fn quit_count(&self) -> usize {
        self.quit.load(Ordering::SeqCst)
    }

    pub fn exit_codes(&self) -> Vec<i32> {
        self.exits.lock().unwrap().clone()
    }

    pub fn fail_relaunch(&self) {
        self.fail_relaunch.store(true, Ordering::SeqCst);
    }
}

impl AppControl for FakeAppControl {
    fn relaunch(&self) -> Result<()> {
        if self.fail_relaunch.load(Ordering::SeqCst) {
            bail!("relaunch refused");
        }
        self.relaunched.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn quit(&self) -> Result<()> {
        self.quit.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn exit(&self, code: i32) {
        self.exits.lock().unwrap().push(code);
    }
}

pub fn workload(name: &str, status: WorkloadStatus) -> Workload {
    Workload::new(name, status)
}

/// Scripted workload API. Listings pop from a queue, then repeat the default.
#[derive(Default)]
pub struct FakeWorkloadApi {
    lists: Mutex<VecDeque<Result<Vec<Workload>, String>>>,
    default_list: Mutex<Vec<Workload>>,
    list_calls: AtomicUsize,
    list_delay: Mutex<Duration>,
    stop_calls: Mutex<Vec<Vec<String>>>,
    restart_calls: Mutex<Vec<Vec<String>>>,
    fail_stop: AtomicBool,
    fail_restart: AtomicBool,
}

impl FakeWorkloadApi {
    pub fn push_list(&self, response: Result<Vec<Workload>, String>) {
        self.lists.lock().unwrap().push_back(response);
    }

    pub fn set_default_list(&self, workloads: Vec<Workload>) {
        *self.default_list.lock().unwrap() = workloads;
    }

    /// Every listing answers only after `delay`.
    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = delay;
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> Vec<Vec<String>> {
        self.stop_calls.lock().unwrap().clone()
    }

    pub fn restart_calls(&self) -> Vec<Vec<String>> {
        self.restart_calls.lock().unwrap().clone()
    }

    pub fn fail_stop(&self) {
        self.fail_stop.store(true, Ordering::SeqCst);
    }

    pub fn fail_restart(&self) {
        self.fail_restart.store(true, Ordering::SeqCst);
    }
}

impl WorkloadApi for FakeWorkloadApi {
    fn list_workloads(&self, _all: bool) -> BoxFuture<'_, Result<Vec<Workload>>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.lists.lock().unwrap().pop_front();
        let response = match next {
            Some(Ok(workloads)) => Ok(workloads),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(self.default_list.lock().unwrap().clone()),
        };
        let delay = *self.list_delay.lock().unwrap();
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            response
        })
    }

    fn stop_workloads<'a>(&'a self, names: &'a [String]) -> BoxFuture<'a, Result<()>> {
        self.stop_calls.lock().unwrap().push(names.to_vec());
        let fail = self.fail_stop.load(Ordering::SeqCst);
        Box::pin(async move {
            if fail {
                bail!("stop rejected");
            }
            Ok(())
        })
    }

    fn restart_workloads<'a>(&'a self, names: &'a [String]) -> BoxFuture<'a, Result<()>> {
        self.restart_calls.lock().unwrap().push(names.to_vec());
        let fail = self.fail_restart.load(Ordering::SeqCst);
        Box::pin(async move {
            if fail {
                bail!("restart rejected");
            }
            Ok(())
        })
    }
}

pub struct FakeConnector {
    api: Arc<FakeWorkloadApi>,
    ports: Mutex<Vec<u16>>,
}

impl FakeConnector {
    pub fn new(api: Arc<FakeWorkloadApi>) -> Self {
        Self {
            api,
            ports: Mutex::new(Vec::new()),
        }
    }

    pub fn ports(&self) -> Vec<u16> {
        self.ports.lock().unwrap().clone()
    }
}

impl WorkloadConnector for FakeConnector {
    fn connect(&self, port: u16) -> Result<Arc<dyn WorkloadApi>> {
        self.ports.lock().unwrap().push(port);
        Ok(Arc::clone(&self.api) as Arc<dyn WorkloadApi>)
    }
}

pub struct FakeUpdater {
    events: broadcast::Sender<UpdateEvent>,
    checks: AtomicUsize,
    installs: AtomicUsize,
    fail_install: AtomicBool,
}

impl Default for FakeUpdater {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            events,
            checks: AtomicUsize::new(0),
            installs: AtomicUsize::new(0),
            fail_install: AtomicBool::new(false),
        }
    }
}

impl FakeUpdater {
    pub fn emit(&self, event: UpdateEvent) {
        let _ = self.events.send(event);
    }

    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn fail_install(&self) {
        self.fail_install.store(true, Ordering::SeqCst);
    }
}

impl PlatformUpdater for FakeUpdater {
    fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    fn check_for_updates(&self) -> Result<()> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn quit_and_install(&self) -> Result<()> {
        if self.fail_install.load(Ordering::SeqCst) {
            bail!("installer exploded");
        }
        self.installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A started supervisor wired into a [`Teardown`] with fakes everywhere.
pub struct TeardownHarness {
    pub teardown: Arc<Teardown>,
    pub spawner: Arc<FakeSpawner>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub api: Arc<FakeWorkloadApi>,
    pub window: Arc<FakeWindow>,
    pub windows: Arc<FakeWindowHost>,
    pub tray: Arc<FakeTrayIcon>,
    pub app: Arc<FakeAppControl>,
    pub lifecycle: Arc<AppLifecycle>,
    _dir: TempDir,
}

impl TeardownHarness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let spawner = Arc::new(FakeSpawner::default());
        let telemetry = Arc::new(RecordingTelemetry::default());
        let tray_icon = Arc::new(FakeTrayIcon::default());
        let tray = Arc::new(Tray::new(tray_icon.clone()));
        let lifecycle = Arc::new(AppLifecycle::new());

        let supervisor = ProcessSupervisor::new(
            sidecar_config_with_binary(dir.path()),
            spawner.clone(),
            telemetry.clone(),
            tray.clone(),
            lifecycle.clone(),
        );
        let started = supervisor.start().await;
        assert!(matches!(started, StartOutcome::Started { .. }), "{started:?}");

        let api = Arc::new(FakeWorkloadApi::default());
        let fleet = Arc::new(FleetShutdown::new(
            Arc::new(FakeConnector::new(api.clone())),
            ShutdownStore::in_dir(&dir.path().join("state")),
            &ShutdownConfig::default(),
        ));

        let window = FakeWindow::new();
        let windows = Arc::new(FakeWindowHost::new(Some(window.clone()), FakeWindow::new()));
        let app = Arc::new(FakeAppControl::default());

        let teardown = Arc::new(Teardown {
            supervisor,
            fleet,
            windows: windows.clone(),
            tray,
            app: app.clone(),
            lifecycle: lifecycle.clone(),
            graceful_exit_delay: Duration::from_millis(500),
        });

        Self {
            teardown,
            spawner,
            telemetry,
            api,
            window,
            windows,
            tray: tray_icon,
            app,
            lifecycle,
            _dir: dir,
        }
    }
}
