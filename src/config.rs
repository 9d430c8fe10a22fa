//! Configuration management

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::server::ServerOptions;
use crate::transport::MAX_FRAME_LEN;

pub const DEFAULT_PORT: u16 = 9111;
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub listener: ListenerConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            root: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub timeout_secs: u64,
    pub default_port: u16,
    pub progress_interval_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout_secs: 30,
            default_port: DEFAULT_PORT,
            progress_interval_ms: 250,
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub chunk_size: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub progress: bool,
}

/// Effective runtime settings after merging config and flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub chunk_size: usize,
    pub timeout: Duration,
    pub default_port: u16,
    pub progress: bool,
    pub progress_interval: Duration,
    pub listener_bind: String,
    pub listener_port: u16,
    pub listener_root: Option<PathBuf>,
}

impl Settings {
    pub fn resolve(config: Config, overrides: &Overrides) -> Result<Self> {
        let chunk_size = overrides.chunk_size.unwrap_or(config.transfer.chunk_size);
        if chunk_size == 0 || chunk_size > MAX_FRAME_LEN {
            anyhow::bail!("Chunk size must be between 1 and {} bytes, got {}", MAX_FRAME_LEN, chunk_size);
        }

        let timeout_secs = overrides.timeout_secs.unwrap_or(config.transfer.timeout_secs);
        if timeout_secs == 0 {
            anyhow::bail!("Timeout must be at least one second");
        }

        Ok(Self {
            chunk_size,
            timeout: Duration::from_secs(timeout_secs),
            default_port: config.transfer.default_port,
            progress: overrides.progress,
            progress_interval: Duration::from_millis(config.transfer.progress_interval_ms.max(10)),
            listener_bind: config.listener.bind,
            listener_port: config.listener.port,
            listener_root: config.listener.root,
        })
    }

    pub fn server_options(&self, root: Option<PathBuf>) -> ServerOptions {
        ServerOptions {
            chunk_size: self.chunk_size,
            timeout: Some(self.timeout),
            root: root.or_else(|| self.listener_root.clone()),
        }
    }
}

fn default_config_dir() -> Result<PathBuf> {
    Ok(directories::ProjectDirs::from("", "", "courier")
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .config_dir()
        .to_path_buf())
}

/// Load `config.toml`, falling back to defaults when there is none.
pub fn load(config_dir: Option<&Path>) -> Result<Config> {
    let dir = match config_dir {
        Some(d) => d.to_path_buf(),
        None => match default_config_dir() {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!("{}; using defaults", e);
                return Ok(Config::default());
            }
        },
    };

    let config_path = dir.join("config.toml");
    if !config_path.exists() {
        tracing::debug!("No config at {:?}; using defaults", config_path);
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(&config_path)?;
    let config: Config = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Invalid config {:?}: {}", config_path, e))?;
    Ok(config)
}

pub fn init(config_dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match config_dir {
        Some(d) => d.to_path_buf(),
        None => default_config_dir()?,
    };

    std::fs::create_dir_all(&dir)?;

    let config_path = dir.join("config.toml");

    if config_path.exists() {
        println!("⚠️  Config already exists: {:?}", config_path);
        return Ok(config_path);
    }

    let config = Config::default();
    let content = toml::to_string_pretty(&config)?;
    std::fs::write(&config_path, content)?;

    println!("✅ Created config: {:?}", config_path);

    Ok(config_path)
}

/// Parse `host[:port]` for the listener, filling in `default_port`. IPv6
/// hosts must be bracketed: `[::1]` or `[::1]:9111`.
pub fn parse_listen_addr(value: &str, default_port: u16) -> Result<(String, u16)> {
    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| anyhow::anyhow!("Unclosed `[` in listen address `{}`", value))?;
        match after {
            "" => (host, None),
            _ => match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => anyhow::bail!("Unexpected `{}` after `]` in listen address `{}`", after, value),
            },
        }
    } else if value.matches(':').count() > 1 {
        anyhow::bail!("IPv6 listen address `{}` must be bracketed, e.g. [::1]:9111", value);
    } else {
        match value.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (value, None),
        }
    };

    if host.is_empty() {
        anyhow::bail!("Listen address `{}` has no host", value);
    }
    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| anyhow::anyhow!("Invalid port in listen address `{}`", value))?,
        None => default_port,
    };
    Ok((host.to_string(), port))
}
