//! Findings and terminal decisions.
//!
//! Subsystems report a [`Finding`] (which rule fired, on what text, asking
//! for which action). The dispatcher turns the first finding into exactly one
//! [`Decision`], which the CLI renders per the host's exit/stdout contract.

use serde::Serialize;

use crate::rules::{Action, RuleMatch};

/// A rule that fired on a specific piece of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub rule: String,
    pub action: Action,
    pub message: String,
    /// The command unit or URL the rule matched.
    pub subject: String,
}

impl Finding {
    pub fn new(
        rule: impl Into<String>,
        action: Action,
        message: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            rule: rule.into(),
            action,
            message: message.into(),
            subject: subject.into(),
        }
    }

    pub fn from_match(matched: RuleMatch<'_>, subject: &str) -> Self {
        Self::new(matched.rule, matched.action, matched.message, subject)
    }

    /// `[rule] message`, the prefix every rendered decision uses.
    pub fn tagged_message(&self) -> String {
        format!("[{}] {}", self.rule, self.message)
    }
}

/// Terminal outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Refuse; guidance goes to stderr with exit status 2.
    Block { rule: String, message: String },
    /// Ask the user; reason is shown in the permission prompt.
    Ask { rule: String, reason: String },
    /// Approve without prompting.
    Allow { reason: String },
    /// Let the host's normal permission flow decide.
    NoOpinion,
}

/// Exit status the host interprets as "blocked".
pub const BLOCK_EXIT_CODE: i32 = 2;

#[derive(Serialize)]
struct HookOutput<'a> {
    #[serde(rename = "hookSpecificOutput")]
    hook_specific_output: HookSpecificOutput<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HookSpecificOutput<'a> {
    hook_event_name: &'static str,
    permission_decision: &'static str,
    permission_decision_reason: &'a str,
}

impl Decision {
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Block { .. })
    }

    #[must_use]
    pub fn is_ask(&self) -> bool {
        matches!(self, Self::Ask { .. })
    }

    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    #[must_use]
    pub fn is_no_opinion(&self) -> bool {
        matches!(self, Self::NoOpinion)
    }

    #[must_use]
    pub fn rule(&self) -> Option<&str> {
        match self {
            Self::Block { rule, .. } | Self::Ask { rule, .. } => Some(rule),
            Self::Allow { .. } | Self::NoOpinion => None,
        }
    }

    /// Human-readable text: block guidance or the ask/allow reason.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Block { message, .. } => Some(message),
            Self::Ask { reason, .. } | Self::Allow { reason } => Some(reason),
            Self::NoOpinion => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_blocked() { BLOCK_EXIT_CODE } else { 0 }
    }

    /// Structured payload for stdout; only ask and allow produce one.
    pub fn stdout_payload(&self) -> Option<String> {
        let (permission_decision, reason) = match self {
            Self::Ask { reason, .. } => ("ask", reason.as_str()),
            Self::Allow { reason } => ("allow", reason.as_str()),
            Self::Block { .. } | Self::NoOpinion => return None,
        };
        let output = HookOutput {
            hook_specific_output: HookSpecificOutput {
                hook_event_name: "PreToolUse",
                permission_decision,
                permission_decision_reason: reason,
            },
        };
        serde_json::to_string(&output).ok()
    }

    /// Guidance for stderr; only block produces any.
    pub fn stderr_text(&self) -> Option<&str> {
        match self {
            Self::Block { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_goes_to_stderr_with_exit_two() {
        let d = Decision::Block {
            rule: "reset-hard".into(),
            message: "[reset-hard] nope".into(),
        };
        assert_eq!(d.exit_code(), 2);
        assert_eq!(d.stderr_text(), Some("[reset-hard] nope"));
        assert!(d.stdout_payload().is_none());
        assert_eq!(d.rule(), Some("reset-hard"));
    }

    #[test]
    fn ask_renders_hook_specific_output() {
        let d = Decision::Ask {
            rule: "stash-drop".into(),
            reason: "[stash-drop] sure?".into(),
        };
        assert_eq!(d.exit_code(), 0);
        let payload: serde_json::Value =
            serde_json::from_str(&d.stdout_payload().unwrap()).unwrap();
        let out = &payload["hookSpecificOutput"];
        assert_eq!(out["hookEventName"], "PreToolUse");
        assert_eq!(out["permissionDecision"], "ask");
        assert_eq!(out["permissionDecisionReason"], "[stash-drop] sure?");
    }

    #[test]
    fn allow_renders_allow_payload() {
        let d = Decision::Allow {
            reason: "[trusted] ok".into(),
        };
        assert!(d.is_allowed());
        assert!(d.stdout_payload().unwrap().contains("\"allow\""));
        assert!(d.stderr_text().is_none());
    }

    #[test]
    fn no_opinion_is_silent() {
        let d = Decision::NoOpinion;
        assert_eq!(d.exit_code(), 0);
        assert!(d.stdout_payload().is_none());
        assert!(d.stderr_text().is_none());
        assert!(d.text().is_none());
    }

    #[test]
    fn decision_serde_is_tagged() {
        let json = serde_json::to_value(Decision::NoOpinion).unwrap();
        assert_eq!(json["decision"], "no_opinion");
    }

    #[test]
    fn finding_tags_message_with_rule() {
        let f = Finding::new("grep", Action::Block, "Use the Grep tool.", "grep x");
        assert_eq!(f.tagged_message(), "[grep] Use the Grep tool.");
    }
}
