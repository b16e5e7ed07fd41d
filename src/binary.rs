//! Locating the `thv` binary and reading its version.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{SidecarConfig, expand_path};

pub const BINARY_NAME: &str = if cfg!(windows) { "thv.exe" } else { "thv" };

/// OS name in the form release tooling uses: `darwin`, `linux`, `win32`.
pub fn platform_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

/// Platform label used for the bundled binary directory, e.g. `darwin-arm64`.
pub fn platform_dir() -> String {
    let os = platform_name();
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "ia32",
        other => other,
    };
    format!("{os}-{arch}")
}

/// `<resources>/bin/<platform>-<arch>/thv[.exe]`
pub fn embedded_binary_path(resources_dir: &Path) -> PathBuf {
    resources_dir
        .join("bin")
        .join(platform_dir())
        .join(BINARY_NAME)
}

/// Picks the binary to launch.
///
/// Packaged builds always use the embedded binary. Dev builds honor the
/// override file when it names an existing file, and fall back to the
/// embedded binary otherwise.
pub fn resolve_binary_path(cfg: &SidecarConfig) -> PathBuf {
    let embedded = embedded_binary_path(&cfg.resources_path());
    if cfg.packaged {
        return embedded;
    }

    let Some(override_file) = cfg.override_path() else {
        return embedded;
    };

    match read_override(&override_file) {
        Ok(Some(path)) => {
            debug!(path = %path.display(), "using thv override binary");
            path
        }
        Ok(None) => embedded,
        Err(err) => {
            warn!(
                override_file = %override_file.display(),
                err = %format!("{err:#}"),
                "ignoring thv override; using embedded binary"
            );
            embedded
        }
    }
}

fn read_override(file: &Path) -> Result<Option<PathBuf>> {
    if !file.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
    let raw = contents.trim();
    if raw.is_empty() {
        bail!("override file is empty");
    }
    let path = expand_path(raw);
    if !path.is_file() {
        bail!("override names a missing binary: {}", path.display());
    }
    Ok(Some(path))
}

/// Runs `<binary> version` and returns the first non-empty output line.
pub async fn read_binary_version(binary: &Path) -> Result<String> {
    let output = Command::new(binary)
        .arg("version")
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to run {} version", binary.display()))?;

    if !output.status.success() {
        bail!(
            "{} version exited with status {}",
            binary.display(),
            output.status
        );
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .with_context(|| format!("{} version printed nothing", binary.display()))
}
