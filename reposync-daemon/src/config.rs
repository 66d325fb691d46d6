//! Daemon configuration: `~/.reposync/config.toml` plus environment overrides.
//!
//! Loaded once at startup and never reloaded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use reposync_sync::{ConflictPolicy, SyncSettings};

use crate::debounce::DebounceSettings;
use crate::error::{io_err, DaemonError};
use crate::paths::{config_path, registry_path_at};

pub const REGISTRY_ENV: &str = "REPOSYNC_REGISTRY";
pub const COOLDOWN_ENV: &str = "REPOSYNC_COOLDOWN_SECS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Registry file; `~/.reposync/registry.json` when unset.
    pub registry_path: Option<PathBuf>,
    pub cooldown_secs: u64,
    pub limit_save_intervals: bool,
    pub branch: String,
    pub remote_name: String,
    pub favor_remote: bool,
    pub git_program: PathBuf,
    pub git_timeout_secs: u64,
    /// Start watching every tracked directory as soon as the daemon boots.
    pub autostart: bool,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            registry_path: None,
            cooldown_secs: 5,
            limit_save_intervals: true,
            branch: "master".to_string(),
            remote_name: "origin".to_string(),
            favor_remote: true,
            git_program: PathBuf::from("git"),
            git_timeout_secs: 120,
            autostart: true,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl DaemonConfig {
    /// `<home>/.reposync/config.toml` with process-environment overrides.
    ///
    /// Overrides that could not be applied come back as messages, so the
    /// caller can report them once logging is installed.
    pub fn load(home: &Path) -> Result<(Self, Vec<String>), DaemonError> {
        let mut config = Self::load_from(config_path(home))?;
        let rejected = config.apply_overrides(|key| std::env::var(key).ok());
        Ok((config, rejected))
    }

    /// Missing file → defaults; unreadable or invalid file → error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, DaemonError> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(io_err(path, err)),
        };
        toml::from_str(&raw).map_err(|source| DaemonError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `REPOSYNC_REGISTRY` / `REPOSYNC_COOLDOWN_SECS` through `lookup`.
    /// Returns one message per override that was ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut rejected = Vec::new();
        if let Some(path) = lookup(REGISTRY_ENV).filter(|v| !v.trim().is_empty()) {
            self.registry_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = lookup(COOLDOWN_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.cooldown_secs = secs,
                Err(err) => rejected.push(format!("ignoring {COOLDOWN_ENV}={raw:?}: {err}")),
            }
        }
        rejected
    }

    pub fn registry_path(&self, home: &Path) -> PathBuf {
        self.registry_path
            .clone()
            .unwrap_or_else(|| registry_path_at(home))
    }

    pub fn debounce(&self) -> DebounceSettings {
        DebounceSettings {
            cooldown: Duration::from_secs(self.cooldown_secs),
            limit_save_intervals: self.limit_save_intervals,
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            git_program: self.git_program.clone(),
            timeout: Duration::from_secs(self.git_timeout_secs),
            branch: self.branch.clone(),
            remote_name: self.remote_name.clone(),
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        ConflictPolicy::from_favor_remote(self.favor_remote)
    }
}
