//! Server configuration: TOML file + CLI overrides.

use gsc_core::GscResult;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub process: ProcessSection,
    #[serde(default)]
    pub console: ConsoleSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_console_port")]
    pub console_port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            control_port: default_control_port(),
            console_port: default_console_port(),
        }
    }
}

/// `[process]` section: the managed game server process.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessSection {
    /// Default launch path used when a start request carries none.
    #[serde(default)]
    pub launch_path: Option<String>,
    /// Working directory for the spawned process.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Line written to the process input for a graceful shutdown.
    #[serde(default = "default_shutdown_command")]
    pub shutdown_command: String,
    /// Grace period before a stubborn process is force-terminated.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

impl Default for ProcessSection {
    fn default() -> Self {
        Self {
            launch_path: None,
            working_dir: None,
            shutdown_command: default_shutdown_command(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

/// `[console]` section: broadcast and session tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleSection {
    /// Recent lines retained for replay to new viewers.
    #[serde(default = "default_backlog")]
    pub backlog: usize,
    /// Per-viewer delivery queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Consecutive unanswered probes before a peer is considered dead.
    #[serde(default = "default_missed_probe_limit")]
    pub missed_probe_limit: u32,
}

impl Default for ConsoleSection {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
            queue_capacity: default_queue_capacity(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            missed_probe_limit: default_missed_probe_limit(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}
fn default_control_port() -> u16 {
    8080
}
fn default_console_port() -> u16 {
    8081
}
fn default_shutdown_command() -> String {
    "stop".to_string()
}
fn default_grace_period_secs() -> u64 {
    10
}
fn default_backlog() -> usize {
    100
}
fn default_queue_capacity() -> usize {
    256
}
fn default_heartbeat_interval_secs() -> u64 {
    5
}
fn default_missed_probe_limit() -> u32 {
    2
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub control_port: u16,
    pub console_port: u16,
    pub launch_path: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub shutdown_command: String,
    pub grace_period: Duration,
    pub backlog: usize,
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub missed_probe_limit: u32,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_control_port: Option<u16>,
        cli_console_port: Option<u16>,
        cli_launch_path: Option<&str>,
    ) -> GscResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content).map_err(|e| {
                    gsc_core::GscError::Other(format!("config parse error: {e}"))
                })?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let bind_addr: IpAddr = file_config.server.bind_addr.parse().map_err(|e| {
            gsc_core::GscError::Other(format!(
                "invalid bind_addr {:?}: {e}",
                file_config.server.bind_addr
            ))
        })?;

        let control_port = cli_control_port.unwrap_or(file_config.server.control_port);
        let console_port = cli_console_port.unwrap_or(file_config.server.console_port);
        let launch_path = cli_launch_path
            .map(|s| s.to_string())
            .or(file_config.process.launch_path);

        Ok(Self {
            bind_addr,
            control_port,
            console_port,
            launch_path,
            working_dir: file_config
                .process
                .working_dir
                .as_deref()
                .map(expand_tilde_str),
            shutdown_command: file_config.process.shutdown_command,
            grace_period: Duration::from_secs(file_config.process.grace_period_secs),
            backlog: file_config.console.backlog,
            queue_capacity: file_config.console.queue_capacity,
            heartbeat_interval: Duration::from_secs(
                file_config.console.heartbeat_interval_secs,
            ),
            missed_probe_limit: file_config.console.missed_probe_limit,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if s.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&s[2..]);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_toml() {
        let cfg: ConfigFile = toml::from_str("").unwrap();
        assert_eq!(cfg.server.control_port, 8080);
        assert_eq!(cfg.server.console_port, 8081);
        assert_eq!(cfg.process.shutdown_command, "stop");
        assert_eq!(cfg.console.backlog, 100);
        assert_eq!(cfg.console.queue_capacity, 256);
    }

    #[test]
    fn sections_parse() {
        let cfg: ConfigFile = toml::from_str(
            r#"
            [server]
            console_port = 9001

            [process]
            launch_path = "/srv/game/run.sh"
            grace_period_secs = 3

            [console]
            backlog = 50
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.console_port, 9001);
        assert_eq!(cfg.server.control_port, 8080);
        assert_eq!(cfg.process.launch_path.as_deref(), Some("/srv/game/run.sh"));
        assert_eq!(cfg.process.grace_period_secs, 3);
        assert_eq!(cfg.console.backlog, 50);
    }

    #[test]
    fn cli_overrides_win() {
        let cfg = ServerConfig::load(None, Some(7000), None, Some("/opt/run.sh")).unwrap();
        assert_eq!(cfg.control_port, 7000);
        assert_eq!(cfg.console_port, 8081);
        assert_eq!(cfg.launch_path.as_deref(), Some("/opt/run.sh"));
    }
}
