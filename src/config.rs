//! Runtime configuration for the intake controller.
//!
//! Read from `config.toml` in the platform config directory
//! (`$XDG_CONFIG_HOME/intakeflow/config.toml` on Linux) unless a path is
//! given explicitly. A missing file means defaults.

use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::flows::draft::{DEFAULT_MAX_AGE_HOURS, DEFAULT_TRANSFER_KEY};
use crate::flows::session::SessionOptions;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Extra flow TOML files layered over the built-in flows.
    #[serde(default)]
    pub flows_dir: Option<String>,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub drafts: DraftSettings,
    #[serde(default)]
    pub checkout: CheckoutSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file for drafts. Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftSettings {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: i64,
    #[serde(default = "default_transfer_key")]
    pub transfer_key: String,
}

impl Default for DraftSettings {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_age_hours: default_max_age_hours(),
            transfer_key: default_transfer_key(),
        }
    }
}

const fn default_debounce_ms() -> u64 {
    1000
}

const fn default_max_age_hours() -> i64 {
    DEFAULT_MAX_AGE_HOURS
}

fn default_transfer_key() -> String {
    DEFAULT_TRANSFER_KEY.into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:3000/api/checkout".into()
}

const fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".into()
}

impl IntakeConfig {
    /// Load from `path`, or from the default location when `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            tracing::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        if config.drafts.max_age_hours <= 0 {
            anyhow::bail!("drafts.max_age_hours must be positive");
        }
        if config.checkout.timeout_secs == 0 {
            anyhow::bail!("checkout.timeout_secs must be positive");
        }
        Ok(config)
    }

    pub fn flows_dir(&self) -> Option<PathBuf> {
        self.flows_dir.as_deref().map(expand)
    }

    /// Draft database location, falling back to the platform data directory
    /// and then the working directory.
    pub fn storage_path(&self) -> PathBuf {
        if let Some(ref p) = self.storage.path {
            return expand(p);
        }
        project_dirs()
            .map(|d| d.data_dir().join("drafts.db"))
            .unwrap_or_else(|| PathBuf::from("intakeflow-drafts.db"))
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_secs(self.checkout.timeout_secs)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            debounce: Duration::from_millis(self.drafts.debounce_ms),
            max_age: chrono::Duration::hours(self.drafts.max_age_hours),
            transfer_key: self.drafts.transfer_key.clone(),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "instantmed", "intakeflow")
}

pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("config.toml"))
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}
