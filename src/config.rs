//! Daemon configuration.
//!
//! Layered: built-in defaults, then an optional YAML file, then
//! environment overrides. The YAML file lives at
//! `~/.config/limitwatch/config.yaml` unless `LIMITWATCH_CONFIG` points
//! elsewhere.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pool::noise::DEFAULT_FALLBACK_WINDOW;
use crate::tokens::ProviderId;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    pub refresh_interval: Duration,
    pub fallback_log_window: Duration,
    /// Providers to poll, in output order.
    pub providers: Vec<ProviderId>,
}

/// On-disk shape; every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    socket_path: Option<PathBuf>,
    refresh_interval_secs: Option<u64>,
    fallback_log_window_secs: Option<u64>,
    providers: Option<Vec<String>>,
}

impl Config {
    /// Built-in defaults rooted at `home`.
    pub fn defaults(home: &Path) -> Self {
        let data_dir = home.join(".config").join("limitwatch");
        Self {
            socket_path: data_dir.join("limitwatch.sock"),
            data_dir,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            fallback_log_window: DEFAULT_FALLBACK_WINDOW,
            providers: ProviderId::ALL.to_vec(),
        }
    }

    /// Load from the user's home directory and process environment.
    pub fn load() -> Result<Self> {
        let home = dirs::home_dir().context("Cannot determine home directory")?;
        Self::load_with(&home, |key| std::env::var(key).ok())
    }

    pub fn load_with(home: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::defaults(home);

        let explicit = env("LIMITWATCH_CONFIG").map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| config.data_dir.join("config.yaml"));

        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let file: FileConfig = serde_yaml::from_str(&raw)
                .with_context(|| format!("Invalid config {}", path.display()))?;
            config.apply(file)?;
        } else if explicit.is_some() {
            anyhow::bail!("Config file {} does not exist", path.display());
        }

        if let Some(socket) = env("LIMITWATCH_SOCKET") {
            config.socket_path = PathBuf::from(socket);
        }
        if let Some(secs) = env("LIMITWATCH_INTERVAL_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .with_context(|| format!("LIMITWATCH_INTERVAL_SECS is not a number: {:?}", secs))?;
            config.refresh_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, file: FileConfig) -> Result<()> {
        if let Some(dir) = file.data_dir {
            // The socket follows the data dir unless set explicitly.
            self.socket_path = dir.join("limitwatch.sock");
            self.data_dir = dir;
        }
        if let Some(socket) = file.socket_path {
            self.socket_path = socket;
        }
        if let Some(secs) = file.refresh_interval_secs {
            self.refresh_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.fallback_log_window_secs {
            self.fallback_log_window = Duration::from_secs(secs);
        }
        if let Some(names) = file.providers {
            let mut providers = Vec::with_capacity(names.len());
            for name in &names {
                let id: ProviderId = name.parse()?;
                if !providers.contains(&id) {
                    providers.push(id);
                }
            }
            self.providers = providers;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.refresh_interval.is_zero() {
            anyhow::bail!("Refresh interval must be at least one second");
        }
        Ok(())
    }
}
