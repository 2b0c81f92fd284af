//! Configuration loading and persistence.
//!
//! Handles reading and writing the courier configuration file. The config
//! lives alongside the registry and cache files in the config directory;
//! the credential material consumed by the transport lives in its own
//! subdirectory and is written only via the credential-change path.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

/// Default long-poll timeout when the caller does not supply one (ms).
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 120_000;

/// Server-side ceiling for caller-supplied long-poll timeouts (ms).
pub const MAX_WAIT_TIMEOUT_MS: u64 = 300_000;

/// Configuration for the courier watcher daemon.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Path to the IPC socket. `None` means the default under the
    /// runtime directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Directory holding transport credential material. `None` means
    /// `<config dir>/credentials`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_dir: Option<PathBuf>,
    /// Messages retained per chat for `fetch_history`.
    pub history_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: None,
            credentials_dir: None,
            history_limit: 100,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `COURIER_CONFIG_DIR` env var: explicit override (tests, relocation)
    /// 2. Default: platform config dir (macOS: ~/Library/Application Support/courier)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("COURIER_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("could not determine config directory")?
                .join("courier")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing or unreadable config file yields the defaults — the daemon
    /// must start on a fresh machine without a setup step.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read config: {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse config: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("COURIER_SOCKET") {
            self.socket_path = Some(PathBuf::from(path));
        }
        if let Ok(dir) = std::env::var("COURIER_CREDENTIALS_DIR") {
            self.credentials_dir = Some(PathBuf::from(dir));
        }
    }

    /// Persist the configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_dir()?.join("config.json");
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).with_context(|| format!("write config: {}", path.display()))
    }

    /// Resolve the effective socket path.
    ///
    /// Priority: explicit config/env value, then `$XDG_RUNTIME_DIR`, then
    /// the config directory.
    pub fn socket_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.socket_path {
            return Ok(path.clone());
        }
        let base = dirs::runtime_dir().map_or_else(Self::config_dir, Ok)?;
        Ok(base.join("courier.sock"))
    }

    /// Resolve the effective credentials directory, creating it if needed.
    pub fn credentials_dir(&self) -> Result<PathBuf> {
        let dir = match self.credentials_dir {
            Some(ref dir) => dir.clone(),
            None => Self::config_dir()?.join("credentials"),
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_history_limit() {
        let config = Config::default();
        assert_eq!(config.history_limit, 100);
    }

    #[test]
    fn test_explicit_socket_path_wins() {
        let config = Config {
            socket_path: Some(PathBuf::from("/tmp/custom.sock")),
            ..Config::default()
        };
        assert_eq!(
            config.socket_path().unwrap(),
            PathBuf::from("/tmp/custom.sock")
        );
    }

    #[test]
    fn test_config_round_trip() {
        let config = Config {
            socket_path: Some(PathBuf::from("/tmp/t.sock")),
            credentials_dir: None,
            history_limit: 42,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.socket_path, config.socket_path);
        assert_eq!(back.history_limit, 42);
    }
}
