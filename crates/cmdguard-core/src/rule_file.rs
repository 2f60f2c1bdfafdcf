//! Side-loaded rule files.
//!
//! A rule file is a JSON array of objects:
//!
//! ```json
//! [{"name": "deploy", "pattern": "^\\s*deploy\\b", "message": "Confirm first.",
//!   "exception": "--dry-run", "action": "ask"}]
//! ```
//!
//! [`load_rules`] is lenient: entries that cannot be compiled are dropped and
//! reported as [`RuleIssue`]s next to the rules that did load. Whether those
//! issues matter is the caller's choice; a hook run ignores them, while
//! [`validate_rules_file`] turns them (plus softer warnings) into a report.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::RuleLoadError;
use crate::rules::{Action, PatternRule};

/// Which table a file extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Command,
    Url,
}

impl RuleKind {
    /// Environment variable naming the file, used to label issues.
    pub const fn env_var(self) -> &'static str {
        match self {
            Self::Command => "COMMAND_GUARD_EXTRA_RULES",
            Self::Url => "URL_GUARD_EXTRA_RULES",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Command => "Command rules",
            Self::Url => "URL rules",
        }
    }
}

/// A problem with one entry of a rule file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleIssue {
    pub index: usize,
    /// The entry's name, or `entry N` when it has none.
    pub name: String,
    pub message: String,
}

impl fmt::Display for RuleIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ({:?}): {}", self.index, self.name, self.message)
    }
}

/// Rules compiled from one file, plus whatever was wrong with it.
#[derive(Debug, Clone, Default)]
pub struct LoadedRules {
    pub rules: Vec<PatternRule>,
    pub issues: Vec<RuleIssue>,
    /// Number of entries in the file.
    pub entries: usize,
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn read_entries(path: &Path) -> Result<Vec<Value>, RuleLoadError> {
    if !path.exists() {
        return Err(RuleLoadError::NotFound(path.to_path_buf()));
    }
    let text = fs::read_to_string(path).map_err(|source| RuleLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&text).map_err(|source| RuleLoadError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    match value {
        Value::Array(entries) => Ok(entries),
        other => Err(RuleLoadError::NotArray(type_name(&other))),
    }
}

/// Load and compile every usable entry of a rule file.
///
/// An empty `exception` is treated as absent so it cannot silently disable
/// its rule; URL rules take no exception at all.
pub fn load_rules(path: &Path, kind: RuleKind) -> Result<LoadedRules, RuleLoadError> {
    let entries = read_entries(path)?;
    let mut loaded = LoadedRules {
        entries: entries.len(),
        ..LoadedRules::default()
    };

    for (index, entry) in entries.iter().enumerate() {
        let mut issue = |message: String| {
            loaded.issues.push(RuleIssue {
                index,
                name: entry_name(entry, index),
                message,
            });
        };
        let Some(obj) = entry.as_object() else {
            issue(format!("expected object, got {}", type_name(entry)));
            continue;
        };
        let field = |key: &str| obj.get(key).and_then(Value::as_str);
        let (Some(name), Some(pattern), Some(message)) =
            (field("name"), field("pattern"), field("message"))
        else {
            issue("missing required string field (name, pattern, message)".to_string());
            continue;
        };
        let exception = match kind {
            RuleKind::Command => field("exception").filter(|exc| !exc.is_empty()),
            RuleKind::Url => None,
        };
        let action = field("action").map_or(Action::Block, Action::parse_or_block);

        match PatternRule::new(name, pattern, exception, message, action) {
            Ok(rule) => loaded.rules.push(rule),
            Err(err) => issue(format!("invalid regex: {err}")),
        }
    }

    if !loaded.issues.is_empty() {
        tracing::warn!(
            path = %path.display(),
            dropped = loaded.issues.len(),
            "some side-loaded rules were not loaded; run `cmdguard validate`"
        );
    }
    Ok(loaded)
}

fn entry_name(entry: &Value, index: usize) -> String {
    entry
        .get("name")
        .and_then(Value::as_str)
        .map_or_else(|| format!("entry {index}"), str::to_string)
}

// ============================================================================
// Validation
// ============================================================================

/// Structural report for one rule file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub kind: RuleKind,
    pub path: PathBuf,
    /// Entries in the file (0 when the file itself is unusable).
    pub count: usize,
    /// One line per problem, already prefixed with the env var.
    pub problems: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }

    /// `Command rules: 3 rule(s) from /path`
    pub fn summary(&self) -> String {
        format!(
            "{}: {} rule(s) from {}",
            self.kind.label(),
            self.count,
            self.path.display()
        )
    }
}

const REQUIRED_FIELDS: [&str; 3] = ["name", "pattern", "message"];

/// Check a rule file for every problem that would weaken the policy:
/// missing or mistyped fields, invalid or empty regexes, bad actions.
pub fn validate_rules_file(path: &Path, kind: RuleKind) -> ValidationReport {
    let env = kind.env_var();
    let mut report = ValidationReport {
        kind,
        path: path.to_path_buf(),
        count: 0,
        problems: Vec::new(),
    };

    let entries = match read_entries(path) {
        Ok(entries) => entries,
        Err(err) => {
            report.problems.push(format!("{env}: {err}"));
            return report;
        }
    };
    if entries.is_empty() {
        report
            .problems
            .push(format!("{env}: file contains empty array (no rules)"));
        return report;
    }
    report.count = entries.len();

    for (index, entry) in entries.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            report.problems.push(format!(
                "{env}[{index}]: expected object, got {}",
                type_name(entry)
            ));
            continue;
        };
        let prefix = format!("{env}[{index}] ({:?})", entry_name(entry, index));
        let mut problem = |message: String| report.problems.push(format!("{prefix}: {message}"));

        for field in REQUIRED_FIELDS {
            match obj.get(field) {
                None => problem(format!("missing required field '{field}'")),
                Some(Value::String(_)) => {}
                Some(other) => problem(format!(
                    "'{field}' must be a string, got {}",
                    type_name(other)
                )),
            }
        }

        if let Some(Value::String(pattern)) = obj.get("pattern") {
            if pattern.is_empty() {
                problem("'pattern' is empty (will match ALL commands/URLs)".to_string());
            } else if let Err(err) = fancy_regex::Regex::new(pattern) {
                problem(format!("invalid regex in 'pattern': {err}"));
            }
        }

        if kind == RuleKind::Command {
            match obj.get("exception") {
                None | Some(Value::Null) => {}
                Some(Value::String(exc)) if exc.is_empty() => problem(
                    "'exception' is empty (matches everything, disabling this rule)".to_string(),
                ),
                Some(Value::String(exc)) => {
                    if let Err(err) = fancy_regex::Regex::new(exc) {
                        problem(format!("invalid regex in 'exception': {err}"));
                    }
                }
                Some(other) => problem(format!(
                    "'exception' must be a string or null, got {}",
                    type_name(other)
                )),
            }
        }

        match obj.get("action") {
            None => {}
            Some(Value::String(action)) if Action::parse(action).is_some() => {}
            Some(Value::String(action)) => problem(format!(
                "'action' must be 'block', 'ask', or 'allow', got {action:?}"
            )),
            Some(other) => problem(format!(
                "'action' must be a string, got {}",
                type_name(other)
            )),
        }
    }
    report
}
