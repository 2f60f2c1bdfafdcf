//! Configuration management for cmdguard
//!
//! A `GuardConfig` starts from built-in defaults, is optionally overlaid by a
//! TOML file, and is finally overridden by environment variables (read by the
//! CLI through clap's `env` support).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audit::AuditLevel;
use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Diagnostic log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}. Expected pretty or json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// SQLite file backing the trust and audit store
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Audit verbosity
    pub audit_level: AuditLevel,

    /// Command prefix that skips discretionary checks; `None` disables bypass
    #[serde(default = "default_bypass_token")]
    pub bypass_token: Option<String>,

    /// Side-loaded command rules (JSON array)
    pub command_rules_path: Option<PathBuf>,

    /// Side-loaded URL rules (JSON array)
    pub url_rules_path: Option<PathBuf>,

    /// Hard timeout for the current-branch query
    #[serde(default = "default_branch_query_timeout_ms")]
    pub branch_query_timeout_ms: u64,

    /// Longest command text the guard will analyze
    #[serde(default = "default_max_command_len")]
    pub max_command_len: usize,

    /// Largest manifest file the cluster classifier will read
    #[serde(default = "default_max_manifest_bytes")]
    pub max_manifest_bytes: u64,

    /// Diagnostic logging
    pub log: LogConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            audit_level: AuditLevel::default(),
            bypass_token: default_bypass_token(),
            command_rules_path: None,
            url_rules_path: None,
            branch_query_timeout_ms: default_branch_query_timeout_ms(),
            max_command_len: default_max_command_len(),
            max_manifest_bytes: default_max_manifest_bytes(),
            log: LogConfig::default(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".claude")
        .join("logs")
        .join("cmdguard.db")
}

/// `~/.config/cmdguard/config.toml` (platform config dir).
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cmdguard")
        .join("config.toml")
}

fn default_bypass_token() -> Option<String> {
    Some("GUARD_BYPASS=1".to_string())
}

fn default_branch_query_timeout_ms() -> u64 {
    5_000
}

fn default_max_command_len() -> usize {
    100_000
}

fn default_max_manifest_bytes() -> u64 {
    1_048_576
}

impl GuardConfig {
    /// Load configuration from a TOML file.
    ///
    /// A path that does not exist yields the defaults; an unreadable or
    /// malformed file is an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply a bypass-token override. An empty token disables bypass.
    #[must_use]
    pub fn with_bypass_token(mut self, token: &str) -> Self {
        let token = token.trim();
        self.bypass_token = (!token.is_empty()).then(|| token.to_string());
        self
    }
}
