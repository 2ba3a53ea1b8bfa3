//! Proxy configuration: TOML file + CLI overrides.

use mudgate_core::{ProxyResult, SessionConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Port the WebSocket listener binds.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Port the operational HTTP endpoints bind.
    #[serde(default = "default_ops_port")]
    pub ops_port: u16,
    /// Scheme-tagged upstream address, e.g. `tls://mud.example.org:7443`.
    #[serde(default = "default_upstream")]
    pub upstream: String,
    /// Whether to prepend a PROXY-protocol v1 line on upstream connect.
    #[serde(default)]
    pub proxy_protocol: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            ops_port: default_ops_port(),
            upstream: default_upstream(),
            proxy_protocol: false,
        }
    }
}

/// `[session]` section: defaults applied to sessions that do not override
/// them in the handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_persistence_timeout")]
    pub persistence_timeout_ms: i64,
    #[serde(default = "default_max_buffer_lines")]
    pub max_buffer_lines: i64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            persistence_timeout_ms: default_persistence_timeout(),
            max_buffer_lines: default_max_buffer_lines(),
        }
    }
}

fn default_port() -> u16 {
    4242
}
fn default_ops_port() -> u16 {
    4243
}
fn default_upstream() -> String {
    "tls://127.0.0.1:7443".to_string()
}
fn default_persistence_timeout() -> i64 {
    mudgate_core::config::DEFAULT_PERSISTENCE_TIMEOUT_MS as i64
}
fn default_max_buffer_lines() -> i64 {
    mudgate_core::config::DEFAULT_MAX_BUFFER_LINES as i64
}

/// Resolved process configuration (file merged with CLI overrides).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// WebSocket listener port.
    pub port: u16,
    /// Operational HTTP endpoint port.
    pub ops_port: u16,
    /// Scheme-tagged upstream address.
    pub upstream: String,
    /// Whether to announce the client address via PROXY protocol v1.
    pub use_proxy_protocol: bool,
    /// Session defaults, already clamped into the published limits.
    pub default_session: SessionConfig,
}

impl ProxyConfig {
    /// Load configuration from a TOML file, then apply CLI overrides.
    ///
    /// A missing config file is not an error; defaults are used silently.
    /// CLI arguments, when `Some`, take precedence over file values.
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_ops_port: Option<u16>,
        cli_upstream: Option<&str>,
        cli_persistence_timeout: Option<i64>,
        cli_max_buffer_lines: Option<i64>,
        cli_proxy_protocol: bool,
    ) -> ProxyResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content).map_err(|e| {
                    mudgate_core::ProxyError::Config(format!("config parse error: {e}"))
                })?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let default_session = SessionConfig::from_raw(
            Some(
                cli_persistence_timeout
                    .unwrap_or(file_config.session.persistence_timeout_ms),
            ),
            Some(cli_max_buffer_lines.unwrap_or(file_config.session.max_buffer_lines)),
            SessionConfig::default(),
        );

        Ok(Self {
            port: cli_port.unwrap_or(file_config.server.port),
            ops_port: cli_ops_port.unwrap_or(file_config.server.ops_port),
            upstream: cli_upstream
                .map(|s| s.to_string())
                .unwrap_or(file_config.server.upstream),
            use_proxy_protocol: cli_proxy_protocol || file_config.server.proxy_protocol,
            default_session,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}
