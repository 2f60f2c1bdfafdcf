//! Audit trail records.
//!
//! Every decision the guard makes can be appended to the store's `events`
//! table. What is written is governed by [`AuditLevel`]; everything written
//! is redacted and truncated first.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Longest subject text stored per event.
pub const MAX_SUBJECT_CHARS: usize = 2000;

/// How much of the guard's activity reaches the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    /// Nothing is recorded.
    Off,
    /// Everything except plain allows.
    #[default]
    Actions,
    /// Everything.
    All,
}

impl AuditLevel {
    /// Unrecognized values fall back to [`AuditLevel::Actions`].
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            tracing::debug!(value, "unknown audit level; using actions");
            Self::Actions
        })
    }

    pub fn records(self, action: AuditAction) -> bool {
        match self {
            Self::Off => false,
            Self::Actions => action != AuditAction::Allowed,
            Self::All => true,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Actions => "actions",
            Self::All => "all",
        }
    }
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "actions" => Ok(Self::Actions),
            "all" => Ok(Self::All),
            other => Err(format!("unknown audit level: {other}. Expected off, actions or all")),
        }
    }
}

/// Which subsystem produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditCategory {
    Guard,
    Url,
    Bypass,
}

impl AuditCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Guard => "guard",
            Self::Url => "url",
            Self::Bypass => "bypass",
        }
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Allowed,
    Trusted,
    Ask,
    Blocked,
    Bypassed,
    AuthFailed,
    Success,
}

impl AuditAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Trusted => "trusted",
            Self::Ask => "ask",
            Self::Blocked => "blocked",
            Self::Bypassed => "bypassed",
            Self::AuthFailed => "auth_failed",
            Self::Success => "success",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row for the `events` table, before session ids and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub category: AuditCategory,
    pub action: AuditAction,
    pub rule: Option<String>,
    pub subject: Option<String>,
    pub detail: Option<Value>,
}

impl AuditEvent {
    pub fn new(category: AuditCategory, action: AuditAction) -> Self {
        Self {
            category,
            action,
            rule: None,
            subject: None,
            detail: None,
        }
    }

    #[must_use]
    pub fn rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Subject as stored: redacted, then cut to [`MAX_SUBJECT_CHARS`].
    pub fn stored_subject(&self) -> Option<String> {
        self.subject
            .as_deref()
            .map(|text| truncate_chars(&redact_secrets(text), MAX_SUBJECT_CHARS))
    }
}

static SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)((?:password|token|secret|key|auth|bearer|api[_-]?key|credentials)[\s=:]+)\S{8,}")
        .unwrap()
});

/// Replace credential-looking values with `[REDACTED]`.
pub fn redact_secrets(text: &str) -> String {
    SECRET.replace_all(text, "${1}[REDACTED]").into_owned()
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_filter_plain_allows() {
        assert!(!AuditLevel::Actions.records(AuditAction::Allowed));
        assert!(AuditLevel::Actions.records(AuditAction::Blocked));
        assert!(AuditLevel::Actions.records(AuditAction::Bypassed));
        assert!(AuditLevel::All.records(AuditAction::Allowed));
        assert!(!AuditLevel::Off.records(AuditAction::Blocked));
    }

    #[test]
    fn unknown_level_falls_back_to_actions() {
        assert_eq!(AuditLevel::parse_lenient("ALL"), AuditLevel::All);
        assert_eq!(AuditLevel::parse_lenient(" off "), AuditLevel::Off);
        assert_eq!(AuditLevel::parse_lenient("verbose"), AuditLevel::Actions);
        assert_eq!(AuditLevel::default(), AuditLevel::Actions);
    }

    #[test]
    fn redacts_credentials() {
        assert_eq!(
            redact_secrets("curl -H 'Authorization: Bearer abcdefgh12345'"),
            "curl -H 'Authorization: Bearer [REDACTED]"
        );
        assert_eq!(
            redact_secrets("export API_KEY=sk-1234567890"),
            "export API_KEY=[REDACTED]"
        );
        assert_eq!(redact_secrets("password=short"), "password=short");
        assert_eq!(redact_secrets("git status"), "git status");
    }

    #[test]
    fn stored_subject_is_truncated_on_char_boundary() {
        let event = AuditEvent::new(AuditCategory::Guard, AuditAction::Blocked)
            .subject("é".repeat(MAX_SUBJECT_CHARS + 10));
        let stored = event.stored_subject().unwrap();
        assert_eq!(stored.chars().count(), MAX_SUBJECT_CHARS);
    }

    #[test]
    fn action_strings() {
        assert_eq!(AuditAction::AuthFailed.as_str(), "auth_failed");
        assert_eq!(AuditAction::Ask.to_string(), "ask");
        assert_eq!(AuditCategory::Url.as_str(), "url");
    }
}
