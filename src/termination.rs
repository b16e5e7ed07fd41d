//! SIGTERM with a timed SIGKILL fallback.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::process::{SidecarHandle, Signal};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Skip SIGTERM and kill immediately.
    pub force: bool,
}

impl StopOptions {
    pub fn graceful() -> Self {
        Self { force: false }
    }

    pub fn forced() -> Self {
        Self { force: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The slot was empty or the process had already exited.
    NoProcess,
    /// SIGTERM sent; a SIGKILL is armed for the end of the grace window.
    Terminating,
    /// SIGKILL sent right away (`force`).
    Killed,
    /// The first signal could not be delivered, so SIGKILL was sent immediately.
    SignalFailed,
}

/// Deferred SIGKILL for one captured process.
///
/// The task owns its own handle clone, so it can only ever signal the process
/// it was armed for, regardless of what the supervisor's slot holds later.
#[derive(Debug)]
struct KillTimer {
    target: Arc<dyn SidecarHandle>,
    task: JoinHandle<()>,
}

impl KillTimer {
    fn arm(target: Arc<dyn SidecarHandle>, grace: Duration) -> Self {
        let handle = Arc::clone(&target);
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let pid = handle.pid();
            if handle.has_exited() {
                debug!(?pid, "process exited within grace period");
                return;
            }
            warn!(
                ?pid,
                grace_ms = grace.as_millis() as u64,
                "process ignored SIGTERM; sending SIGKILL"
            );
            if let Err(err) = handle.signal(Signal::Kill) {
                warn!(?pid, ?err, "failed to SIGKILL process");
            }
        });
        Self { target, task }
    }

    fn is_pending(&self) -> bool {
        !self.task.is_finished() && !self.target.has_exited()
    }

    fn cancel(self) {
        debug!(pid = ?self.target.pid(), "cancelling pending kill timer");
        self.task.abort();
    }
}

/// Owns the single pending kill timer and performs stops against a process slot.
#[derive(Debug)]
pub struct TerminationController {
    grace: Duration,
    pending: Mutex<Option<KillTimer>>,
}

impl TerminationController {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            pending: Mutex::new(None),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// True while a stopped process is still alive and its SIGKILL has not fired yet.
    pub fn has_pending_kill(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(KillTimer::is_pending)
    }

    /// Stops whatever process `slot` holds and empties the slot.
    ///
    /// Must be called from within a tokio runtime when `force` is false, since
    /// the deferred SIGKILL runs as a spawned task.
    pub fn stop(
        &self,
        slot: &mut Option<Arc<dyn SidecarHandle>>,
        options: StopOptions,
    ) -> StopOutcome {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.take() {
            previous.cancel();
        }

        let handle = match slot.take() {
            Some(handle) if !handle.has_exited() => handle,
            _ => {
                info!("no process to stop");
                return StopOutcome::NoProcess;
            }
        };

        let pid = handle.pid();
        handle.mark_stop_requested();

        let first = if options.force {
            Signal::Kill
        } else {
            Signal::Term
        };
        info!(?pid, signal = %first, "stopping sidecar process");

        if let Err(err) = handle.signal(first) {
            warn!(?pid, signal = %first, ?err, "failed to signal process; sending SIGKILL");
            if let Err(err) = handle.signal(Signal::Kill) {
                warn!(?pid, ?err, "failed to SIGKILL process");
            }
            return StopOutcome::SignalFailed;
        }

        if options.force {
            return StopOutcome::Killed;
        }

        *pending = Some(KillTimer::arm(handle, self.grace));
        StopOutcome::Terminating
    }
}
