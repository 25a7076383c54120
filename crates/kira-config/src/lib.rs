#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-config** – Runtime configuration.
//!
//! A single YAML file (`kira.yaml`) supplies everything: the vault path
//! (required), the IANA timezone (default `Europe/Brussels`), pipeline and
//! scheduler knobs, and free-form per-adapter / per-plugin sections the
//! core passes through untouched. `KIRA_VAULT_PATH` overrides the vault
//! path for ad-hoc runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Environment variable overriding `vault.path`.
pub const VAULT_PATH_ENV: &str = "KIRA_VAULT_PATH";

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Configuration errors (CLI exit code 6).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Config file path.
        path: PathBuf,
        /// OS-level error.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid YAML (or has the wrong shape).
    #[error("invalid config: {0}")]
    Parse(String),
    /// `vault.path` is missing and no environment override is set.
    #[error("vault.path is required (set it in kira.yaml or via {VAULT_PATH_ENV})")]
    MissingVaultPath,
    /// `vault.tz` does not name a known IANA timezone.
    #[error(transparent)]
    InvalidTimezone(#[from] kira_time::TimeError),
}

//─────────────────────────────
//  Sections
//─────────────────────────────

fn default_tz() -> String {
    "Europe/Brussels".to_string()
}

/// The `vault:` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VaultSection {
    /// Vault root directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// IANA timezone for day windows and ID timestamps.
    #[serde(default = "default_tz")]
    pub tz: String,
}

impl Default for VaultSection {
    fn default() -> Self {
        Self { path: None, tz: default_tz() }
    }
}

fn default_grace_period() -> f64 {
    5.0
}
fn default_max_buffer() -> usize {
    1000
}
fn default_dedupe_ttl() -> i64 {
    30
}

/// The `pipeline:` section: grace buffer and dedupe knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSection {
    /// Grace period in seconds (sensible range 3–10).
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: f64,
    /// Maximum buffered events before eviction.
    #[serde(default = "default_max_buffer")]
    pub max_buffer_size: usize,
    /// Days before seen-event records are cleaned up.
    #[serde(default = "default_dedupe_ttl")]
    pub dedupe_ttl_days: i64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            grace_period_seconds: default_grace_period(),
            max_buffer_size: default_max_buffer(),
            dedupe_ttl_days: default_dedupe_ttl(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KiraConfig {
    /// Vault location and timezone.
    #[serde(default)]
    pub vault: VaultSection,
    /// Event pipeline knobs.
    #[serde(default)]
    pub pipeline: PipelineSection,
    /// Free-form adapter sections, passed through to adapters.
    #[serde(default)]
    pub adapters: BTreeMap<String, serde_yaml::Value>,
    /// Free-form plugin sections, passed through to plugins.
    #[serde(default)]
    pub plugins: BTreeMap<String, serde_yaml::Value>,
}

impl KiraConfig {
    /// Parse from YAML text and apply the environment override.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let mut config: KiraConfig =
            serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.apply_env_override();
        Ok(config)
    }

    /// Load from a file and apply the environment override.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "configuration loaded");
        Self::from_yaml(&raw)
    }

    fn apply_env_override(&mut self) {
        if let Ok(path) = std::env::var(VAULT_PATH_ENV) {
            if !path.is_empty() {
                self.vault.path = Some(PathBuf::from(path));
            }
        }
    }

    /// The vault path; required.
    pub fn vault_path(&self) -> Result<&Path, ConfigError> {
        self.vault
            .path
            .as_deref()
            .ok_or(ConfigError::MissingVaultPath)
    }

    /// The configured timezone, validated.
    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        Ok(kira_time::parse_timezone(&self.vault.tz)?)
    }
}
