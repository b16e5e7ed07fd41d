//! Single-instance guard for `run` mode.
//!
//! The lock is a pid file created with `create_new` in the state dir. A lock
//! whose pid is no longer alive is left over from a crash and gets replaced.

use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, warn};

use crate::process::process_alive;

pub const LOCK_FILE: &str = "supervisor.lock";

#[derive(Debug, Error)]
#[error("another thv-supervisor instance is already running (pid {pid}, lock {})", .path.display())]
pub struct AlreadyRunning {
    pub pid: u32,
    pub path: PathBuf,
}

/// Held for the lifetime of the daemon; the lock file is removed on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(LOCK_FILE);
        // Second pass runs only after a stale lock was removed.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())
                        .and_then(|()| file.sync_all())
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    debug!(path = %path.display(), "instance lock taken");
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => match read_pid(&path) {
                    Some(pid) if process_alive(pid) => {
                        return Err(AlreadyRunning { pid, path }.into());
                    }
                    holder => {
                        warn!(path = %path.display(), ?holder, "removing stale instance lock");
                        match fs::remove_file(&path) {
                            Ok(()) => {}
                            Err(err) if err.kind() == ErrorKind::NotFound => {}
                            Err(err) => {
                                return Err(err).with_context(|| {
                                    format!("failed to remove stale lock {}", path.display())
                                });
                            }
                        }
                    }
                },
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create {}", path.display()));
                }
            }
        }
        anyhow::bail!("instance lock {} keeps reappearing", path.display())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), ?err, "failed to remove instance lock");
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse().ok().filter(|pid| *pid != 0)
}
