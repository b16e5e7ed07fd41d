//! OS process primitives the supervisor is built on.
//!
//! The supervisor only ever talks to a [`Spawner`] and the [`SidecarHandle`]s it
//! returns, which keeps the signal and timer logic testable without real
//! processes.

use std::{
    fmt, io,
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{io::AsyncRead, process::Command, sync::mpsc};

/// Signals the supervisor sends to the sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful shutdown request.
    Term,
    /// Forced, uncatchable termination.
    Kill,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Term => f.write_str("SIGTERM"),
            Signal::Kill => f.write_str("SIGKILL"),
        }
    }
}

/// Lifetime events reported for a spawned process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The process ended. `code` is `None` when it was terminated by a signal.
    Exited { code: Option<i32> },
    /// Waiting on the process failed at the OS level.
    Error { message: String },
}

/// A live (or recently live) sidecar process.
pub trait SidecarHandle: Send + Sync + fmt::Debug {
    fn pid(&self) -> Option<u32>;

    /// True once the process has been reaped.
    fn has_exited(&self) -> bool;

    fn signal(&self, signal: Signal) -> io::Result<()>;

    /// Records that the supervisor asked this process to go away, so its exit is not a crash.
    fn mark_stop_requested(&self);

    fn stop_requested(&self) -> bool;
}

/// Everything needed to launch the sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub binary: PathBuf,
    pub args: Vec<String>,
}

pub type StderrReader = Box<dyn AsyncRead + Send + Unpin>;

/// A freshly spawned sidecar: its handle, piped stderr, and a stream of lifetime events.
pub struct SpawnedSidecar {
    pub handle: Arc<dyn SidecarHandle>,
    pub stderr: Option<StderrReader>,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

pub trait Spawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedSidecar>;
}

/// Spawns real child processes with tokio and watches them for exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedSidecar> {
        let mut cmd = Command::new(&request.binary);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let handle = Arc::new(ChildHandle::new(child.id()));
        let stderr = child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as StderrReader);

        let (tx, events) = mpsc::unbounded_channel();
        let watched = Arc::clone(&handle);
        tokio::spawn(async move {
            let event = match child.wait().await {
                Ok(status) => ProcessEvent::Exited {
                    code: status.code(),
                },
                Err(err) => ProcessEvent::Error {
                    message: err.to_string(),
                },
            };
            watched.mark_exited();
            // receiver gone means the supervisor no longer cares
            let _ = tx.send(event);
        });

        Ok(SpawnedSidecar {
            handle,
            stderr,
            events,
        })
    }
}

/// Handle for a child spawned by [`TokioSpawner`]. Signals go through the pid.
#[derive(Debug)]
pub struct ChildHandle {
    pid: Option<u32>,
    exited: AtomicBool,
    stop_requested: AtomicBool,
}

impl ChildHandle {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            exited: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }

    fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }
}

impl SidecarHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn signal(&self, signal: Signal) -> io::Result<()> {
        // A reaped pid may already belong to someone else.
        if self.has_exited() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "process has already exited",
            ));
        }
        let Some(pid) = self.pid else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "process has no pid",
            ));
        };
        send_signal(pid, signal)
    }

    fn mark_stop_requested(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    let raw = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    let rc = unsafe { libc::kill(pid, raw) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(windows)]
fn send_signal(pid: u32, _signal: Signal) -> io::Result<()> {
    // Windows has no graceful signal for console-less children; both map to a tree kill.
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F", "/T"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "taskkill exited with status {}",
            status.code().unwrap_or(-1)
        )))
    }
}

/// Whether a process with `pid` exists, even if it belongs to another user.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn process_alive(pid: u32) -> bool {
    let needle = pid.to_string();
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .stderr(Stdio::null())
        .output()
        .map(|output| {
            output.status.success()
                && String::from_utf8_lossy(&output.stdout)
                    .split_whitespace()
                    .any(|field| field == needle)
        })
        .unwrap_or(false)
}
