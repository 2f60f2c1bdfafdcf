//! Error types for cmdguard-core

use std::fmt::Write;
use std::path::PathBuf;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cmdguard-core
#[derive(Error, Debug)]
pub enum Error {
    /// Trust/audit store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Side-loaded rule file errors
    #[error("Rules error: {0}")]
    Rules(#[from] RuleLoadError),

    /// Trust management rejected the request
    #[error("Trust error: {0}")]
    Trust(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Storage(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Rules(_) => Some(
                Remediation::new("Fix the side-loaded rule file and re-run validation.")
                    .command("Validate", "cmdguard validate")
                    .alternative("Unset COMMAND_GUARD_EXTRA_RULES / URL_GUARD_EXTRA_RULES to run built-ins only."),
            ),
            Self::Trust(_) => Some(
                Remediation::new("Check the rule name and scope, then retry.")
                    .command("List trusted rules", "cmdguard trust list"),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the store directory exists and is writable."),
            ),
            Self::Json(_) => None,
        }
    }
}

/// Trust/audit store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Store directory or file could not be prepared
    #[error("cannot prepare store at {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Sqlite(_) => Remediation::new("The guard database may be locked or corrupt.")
                .command("Inspect", "sqlite3 \"$GUARD_DB_PATH\" 'PRAGMA integrity_check'")
                .alternative("Point GUARD_DB_PATH at a fresh location."),
            Self::Prepare { path, .. } => Remediation::new(format!(
                "Make sure {} is writable by the current user.",
                path.display()
            )),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Read { .. } => Remediation::new("Check the CMDGUARD_CONFIG path and permissions."),
            Self::Parse { .. } => Remediation::new("Fix the TOML syntax or remove unknown keys.")
                .alternative("Delete the config file to fall back to built-in defaults."),
        }
    }
}

/// Errors loading a side-loaded rule file as a whole.
///
/// Per-entry problems are not errors: they are reported as
/// [`crate::rule_file::RuleIssue`]s next to the rules that did load.
#[derive(Error, Debug)]
pub enum RuleLoadError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("expected a JSON array of rule objects, got {0}")]
    NotArray(&'static str),
}
