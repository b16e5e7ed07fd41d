use std::{
    fs,
    net::IpAddr,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use shellexpand::tilde;

/// Top-level configuration for thv-supervisor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub sidecar: SidecarConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub control: ControlConfig,
    /// Where persisted state (shutdown snapshot) lives. Defaults to ~/.config/thv-supervisor/state.
    #[serde(default, alias = "state-dir")]
    pub state_dir: Option<String>,
}

/// How the `thv` sidecar is located and launched.
#[derive(Debug, Clone, Deserialize)]
pub struct SidecarConfig {
    /// Packaged builds always use the embedded binary and ignore the override file.
    #[serde(default)]
    pub packaged: bool,
    /// Directory containing `bin/<platform>-<arch>/thv`.
    #[serde(default = "default_resources_dir", alias = "resources-dir")]
    pub resources_dir: String,
    /// Dev-only file whose contents name an alternative `thv` binary.
    #[serde(default, alias = "override-file")]
    pub override_file: Option<String>,
    #[serde(default = "default_sidecar_host")]
    pub host: IpAddr,
    #[serde(default = "default_port_range_start", alias = "port-range-start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end", alias = "port-range-end")]
    pub port_range_end: u16,
    #[serde(default = "default_kill_grace_ms", alias = "kill-grace-ms")]
    pub kill_grace_ms: u64,
    #[serde(default = "default_restart_cooldown_ms", alias = "restart-cooldown-ms")]
    pub restart_cooldown_ms: u64,
}

impl SidecarConfig {
    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }

    pub fn resources_path(&self) -> PathBuf {
        expand_path(&self.resources_dir)
    }

    pub fn override_path(&self) -> Option<PathBuf> {
        self.override_file.as_deref().map(expand_path)
    }
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            packaged: false,
            resources_dir: default_resources_dir(),
            override_file: None,
            host: default_sidecar_host(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            kill_grace_ms: default_kill_grace_ms(),
            restart_cooldown_ms: default_restart_cooldown_ms(),
        }
    }
}

/// Fleet-wide stop behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_poll_interval_ms", alias = "poll-interval-ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stop_timeout_ms", alias = "timeout-ms")]
    pub timeout_ms: u64,
}

impl ShutdownConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_ms: default_stop_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How long the renderer gets to react to a graceful-exit notification.
    #[serde(default = "default_graceful_exit_delay_ms", alias = "graceful-exit-delay-ms")]
    pub graceful_exit_delay_ms: u64,
    /// Headless mode answers the restart dialog with this choice.
    #[serde(default, alias = "auto-restart")]
    pub auto_restart: bool,
    /// Shell command invoked by the headless updater to install a downloaded release.
    #[serde(default, alias = "install-command")]
    pub install_command: Option<String>,
    /// Shell command invoked by the headless updater to look for a release.
    #[serde(default, alias = "check-command")]
    pub check_command: Option<String>,
    /// Period of the background update check once updates are enabled.
    #[serde(default = "default_check_interval_ms", alias = "check-interval-ms")]
    pub check_interval_ms: u64,
    /// Shorter period used after the user asked for an update manually.
    #[serde(
        default = "default_manual_check_interval_ms",
        alias = "manual-check-interval-ms"
    )]
    pub manual_check_interval_ms: u64,
    /// Release feed answering with the newest published tag.
    #[serde(default = "default_release_url", alias = "release-url")]
    pub release_url: String,
}

impl UpdateConfig {
    pub fn graceful_exit_delay(&self) -> Duration {
        Duration::from_millis(self.graceful_exit_delay_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn manual_check_interval(&self) -> Duration {
        Duration::from_millis(self.manual_check_interval_ms)
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            graceful_exit_delay_ms: default_graceful_exit_delay_ms(),
            auto_restart: false,
            install_command: None,
            check_command: None,
            check_interval_ms: default_check_interval_ms(),
            manual_check_interval_ms: default_manual_check_interval_ms(),
            release_url: default_release_url(),
        }
    }
}

/// Local control server exposing supervisor state to the UI layer.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_control_host")]
    pub host: IpAddr,
    #[serde(default = "default_control_port")]
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_control_host(),
            port: default_control_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_resources_dir() -> String {
    ".".to_string()
}

fn default_sidecar_host() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_port_range_start() -> u16 {
    50000
}

fn default_port_range_end() -> u16 {
    50100
}

fn default_kill_grace_ms() -> u64 {
    2000
}

fn default_restart_cooldown_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_stop_timeout_ms() -> u64 {
    40_000
}

fn default_graceful_exit_delay_ms() -> u64 {
    500
}

fn default_check_interval_ms() -> u64 {
    10 * 60 * 1000
}

fn default_manual_check_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_release_url() -> String {
    "https://stacklok.github.io/toolhive-studio/latest".to_string()
}

fn default_control_host() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_control_port() -> u16 {
    51234
}

/// Global config directory: ~/.config/thv-supervisor
pub fn global_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/thv-supervisor")
}

pub fn default_config_path() -> PathBuf {
    global_config_dir().join("config.toml")
}

impl Config {
    pub fn state_dir(&self) -> PathBuf {
        match self.state_dir.as_deref() {
            Some(dir) => expand_path(dir),
            None => global_config_dir().join("state"),
        }
    }
}

pub fn ensure_state_dir(cfg: &Config) -> Result<PathBuf> {
    let dir = cfg.state_dir();
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(dir)
}

pub fn expand_path(raw: &str) -> PathBuf {
    let tilde_expanded = tilde(raw).into_owned();
    let env_expanded = match shellexpand::env(&tilde_expanded) {
        Ok(val) => val.into_owned(),
        Err(_) => tilde_expanded,
    };
    PathBuf::from(env_expanded)
}

pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;
    validate(&cfg).with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

pub fn load_or_default<P: AsRef<Path>>(path: P) -> Config {
    let path = path.as_ref();
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file; using defaults");
        return Config::default();
    }
    match load(path) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::warn!(?err, "failed to load supervisor config; using defaults");
            Config::default()
        }
    }
}

fn validate(cfg: &Config) -> Result<()> {
    if cfg.sidecar.port_range_start > cfg.sidecar.port_range_end {
        bail!(
            "sidecar.port_range_start ({}) must not exceed sidecar.port_range_end ({})",
            cfg.sidecar.port_range_start,
            cfg.sidecar.port_range_end
        );
    }
    if cfg.shutdown.poll_interval_ms == 0 {
        bail!("shutdown.poll_interval_ms must be greater than zero");
    }
    if cfg.update.check_interval_ms == 0 || cfg.update.manual_check_interval_ms == 0 {
        bail!("update check intervals must be greater than zero");
    }
    Ok(())
}
