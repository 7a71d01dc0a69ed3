//! Configuration loading and defaults for idle-watchdogd.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::activity::ActivityKind;

/// Main configuration for idle-watchdogd.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Milliseconds of inactivity before the session is idle (default: 900000).
    pub timeout_ms: u64,

    /// Activity kinds that count as user presence (default: all).
    pub activity_kinds: Vec<ActivityKind>,

    /// Command run once when the session goes idle, as program + args.
    /// If unset, the idle event is only logged.
    pub idle_command: Option<Vec<String>>,

    /// Unix socket to read activity signals from.
    /// If unset, signals are read from stdin.
    pub socket_path: Option<PathBuf>,

    /// Dry run mode: log the idle command instead of executing it.
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout_ms: 900_000,
            activity_kinds: ActivityKind::ALL.to_vec(),
            idle_command: None,
            socket_path: None,
            dry_run: false,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from the given path, the default path, or defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }

        if let Some(default_path) = Self::default_path()
            && default_path.exists()
        {
            return Self::load(&default_path);
        }

        Ok(Self::default())
    }

    /// Default config location: `$XDG_CONFIG_HOME/idle-watchdog/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("idle-watchdog").join("config.toml"))
    }

    /// Idle period as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
