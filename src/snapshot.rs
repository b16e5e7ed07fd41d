//! Persisted list of workloads that were running right before the last teardown.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::workloads::Workload;

pub const SNAPSHOT_FILE: &str = "server-shutdown.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotFile {
    #[serde(rename = "lastShutdownServers", default)]
    last_shutdown_servers: Vec<Workload>,
}

#[derive(Debug, Clone)]
pub struct ShutdownStore {
    path: PathBuf,
}

impl ShutdownStore {
    /// Store backed by `server-shutdown.json` inside `state_dir`.
    pub fn in_dir(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(SNAPSHOT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the stored snapshot, preserving workload order.
    pub fn save(&self, workloads: &[Workload]) -> Result<()> {
        let snapshot = SnapshotFile {
            last_shutdown_servers: workloads.to_vec(),
        };
        self.write(&snapshot)
    }

    /// Returns the stored snapshot; a missing file is an empty snapshot.
    pub fn load(&self) -> Result<Vec<Workload>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(parse_snapshot(&contents, &self.path)?.last_shutdown_servers)
    }

    pub fn clear(&self) -> Result<()> {
        self.write(&SnapshotFile::default())?;
        info!("shutdown history cleared");
        Ok(())
    }

    fn write(&self, snapshot: &SnapshotFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let temp_path = self
            .path
            .with_extension(format!("json.tmp.{}", std::process::id()));
        let contents = serde_json::to_string_pretty(snapshot)?;

        {
            let mut file = fs::File::create(&temp_path)
                .with_context(|| format!("failed to create {}", temp_path.display()))?;
            file.write_all(contents.as_bytes())
                .with_context(|| format!("failed to write {}", temp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to sync {}", temp_path.display()))?;
        }

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "failed to replace shutdown snapshot {} from {}",
                self.path.display(),
                temp_path.display()
            )
        })?;
        Ok(())
    }
}

fn parse_snapshot(contents: &str, path: &Path) -> Result<SnapshotFile> {
    match serde_json::from_str::<SnapshotFile>(contents) {
        Ok(snapshot) => Ok(snapshot),
        Err(primary_err) => {
            // An interrupted write can leave junk after a complete object.
            let mut de = serde_json::Deserializer::from_str(contents);
            match SnapshotFile::deserialize(&mut de) {
                Ok(snapshot) => {
                    warn!(
                        path = %path.display(),
                        error = %primary_err,
                        "shutdown snapshot had a trailing invalid suffix; recovered first JSON value"
                    );
                    Ok(snapshot)
                }
                Err(_) => {
                    Err(primary_err).with_context(|| format!("failed to parse {}", path.display()))
                }
            }
        }
    }
}
