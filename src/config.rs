// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Configuration for the access layer
//!
//! All data is stored under ~/.ztwim/:
//! - ~/.ztwim/config.json - client configuration (overridden by $ZTWIM_CONFIG)
//! - ~/.ztwim/log/ - rotating log files

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::kubernetes::ConflictBackoff;

/// Environment variable pointing at an alternative config file
pub const CONFIG_ENV: &str = "ZTWIM_CONFIG";

/// Default field manager recorded on every write
pub const DEFAULT_FIELD_MANAGER: &str = "zero-trust-workload-identity-manager";

/// Get the base directory (~/.ztwim/)
pub fn base_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|p| p.join(".ztwim"))
        .context("Could not determine home directory")
}

/// Conflict retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay added at random (0.1 = up to +10%)
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let backoff = ConflictBackoff::default();
        Self {
            max_attempts: backoff.max_attempts,
            base_delay_ms: backoff.base_delay.as_millis() as u64,
            max_delay_ms: backoff.max_delay.as_millis() as u64,
            jitter: backoff.jitter,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> ConflictBackoff {
        ConflictBackoff::default()
            .with_max_attempts(self.max_attempts.max(1))
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter(self.jitter.clamp(0.0, 1.0))
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Kubeconfig context (None uses the current context)
    pub context: Option<String>,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Time allowed for every eager watch to finish its initial list
    pub cache_sync_timeout_secs: u64,
    pub field_manager: String,
    pub retry: RetrySettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            context: None,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            cache_sync_timeout_secs: 120,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            retry: RetrySettings::default(),
        }
    }
}

impl Config {
    /// Load config from $ZTWIM_CONFIG or ~/.ztwim/config.json, or return default if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load config from a specific file, or return default if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save config to its default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Get the config file path ($ZTWIM_CONFIG or ~/.ztwim/config.json)
    pub fn config_path() -> Result<PathBuf> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => Ok(base_dir()?.join("config.json")),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }
}
