//! Trust entries: stored pre-approvals for ask-type rules.
//!
//! An entry names one rule, optionally narrowed by a case-insensitive
//! substring of the matched text, and is scoped either to the session that
//! created it or to every future session. Block rules can never be trusted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rules::RuleSet;

/// Longest accepted `--match` substring.
pub const MAX_MATCH_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustScope {
    /// Only the session that granted it.
    Session,
    /// Every session from now on.
    #[default]
    Always,
}

impl TrustScope {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Always => "always",
        }
    }
}

impl fmt::Display for TrustScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "always" => Ok(Self::Always),
            other => Err(format!("invalid scope {other:?}: expected session or always")),
        }
    }
}

/// One row of `trusted_rules`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEntry {
    pub rule_name: String,
    pub match_pattern: Option<String>,
    pub scope: TrustScope,
    pub session_id: Option<String>,
    pub created_ts: String,
}

impl TrustEntry {
    /// Whether this entry pre-approves `subject` in `session_id`.
    pub fn permits(&self, subject: Option<&str>, session_id: Option<&str>) -> bool {
        if self.scope == TrustScope::Session && self.session_id.as_deref() != session_id {
            return false;
        }
        match (self.match_pattern.as_deref(), subject) {
            (Some(pattern), Some(text)) if !pattern.is_empty() => {
                text.to_lowercase().contains(&pattern.to_lowercase())
            }
            _ => true,
        }
    }

    /// `rule='x' match='y' scope=always`
    pub fn describe(&self) -> String {
        let mut desc = format!("rule={:?}", self.rule_name);
        if let Some(pattern) = &self.match_pattern {
            desc.push_str(&format!(" match={pattern:?}"));
        }
        desc.push_str(&format!(" scope={}", self.scope));
        desc
    }
}

/// A validated request to add a trust entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustGrant {
    pub rule_name: String,
    pub match_pattern: Option<String>,
    pub scope: TrustScope,
    /// Present exactly when `scope` is session.
    pub session_id: Option<String>,
}

impl TrustGrant {
    /// Check a grant against the active rule set.
    ///
    /// Session scope needs an id: the explicit one, else the last one the
    /// guard saw.
    pub fn new(
        rules: &RuleSet,
        rule_name: &str,
        match_pattern: Option<String>,
        scope: TrustScope,
        session_id: Option<String>,
        last_session_id: impl FnOnce() -> Option<String>,
    ) -> Result<Self> {
        if !rules.is_trustable(rule_name) {
            let names: Vec<String> = rules.trustable_rule_names().into_iter().collect();
            return Err(Error::Trust(format!(
                "'{rule_name}' is not an ask-type rule. Trustable rules: {}",
                names.join(", ")
            )));
        }
        if let Some(pattern) = &match_pattern {
            if pattern.chars().count() > MAX_MATCH_LEN {
                return Err(Error::Trust(format!(
                    "--match pattern too long (max {MAX_MATCH_LEN} characters)"
                )));
            }
        }
        let session_id = match scope {
            TrustScope::Always => None,
            TrustScope::Session => Some(session_id.or_else(last_session_id).ok_or_else(|| {
                Error::Trust(
                    "No session ID found. Run a guard check first, provide --session-id, \
                     or use --scope always."
                        .to_string(),
                )
            })?),
        };
        Ok(Self {
            rule_name: rule_name.to_string(),
            match_pattern,
            scope,
            session_id,
        })
    }
}
