//! Per-invocation guard context.
//!
//! Owns everything one hook event needs: configuration, the active rule set,
//! the event's identity, and two lazily created collaborators (the trust and
//! audit store, and the branch probe). Nothing here is shared across
//! processes; each hook invocation builds a fresh context.

use std::cell::OnceCell;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audit::{AuditAction, AuditCategory, AuditEvent};
use crate::config::GuardConfig;
use crate::decision::{Decision, Finding};
use crate::event::HookInput;
use crate::git_safety::{BranchProbe, GitBranchProbe};
use crate::manifest::ManifestLimits;
use crate::rule_file::{self, RuleKind};
use crate::rules::{Action, RuleSet};
use crate::store::{EventIds, GuardStore};

pub struct GuardContext {
    pub config: GuardConfig,
    pub rules: RuleSet,
    pub session_id: Option<String>,
    pub tool_use_id: Option<String>,
    /// Working directory of the agent, if the event carried one.
    pub cwd: Option<PathBuf>,
    store: OnceCell<Option<GuardStore>>,
    probe: OnceCell<Box<dyn BranchProbe>>,
}

impl fmt::Debug for GuardContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardContext")
            .field("session_id", &self.session_id)
            .field("tool_use_id", &self.tool_use_id)
            .field("cwd", &self.cwd)
            .field("store_opened", &self.store.get().is_some())
            .finish_non_exhaustive()
    }
}

impl GuardContext {
    pub fn new(config: GuardConfig, rules: RuleSet) -> Self {
        Self {
            config,
            rules,
            session_id: None,
            tool_use_id: None,
            cwd: None,
            store: OnceCell::new(),
            probe: OnceCell::new(),
        }
    }

    /// Built-in rules plus whatever side-loaded files the config names.
    ///
    /// Unreadable files and bad entries are skipped; `cmdguard validate` is
    /// where they get reported.
    pub fn from_config(config: GuardConfig) -> Self {
        let mut rules = RuleSet::builtin();
        if let Some(path) = &config.command_rules_path {
            if let Some(extra) = load_side_rules(path, RuleKind::Command) {
                rules = rules.with_extra_command_rules(extra);
            }
        }
        if let Some(path) = &config.url_rules_path {
            if let Some(extra) = load_side_rules(path, RuleKind::Url) {
                rules = rules.with_extra_url_rules(extra);
            }
        }
        Self::new(config, rules)
    }

    /// Use a store that is already open instead of opening `db_path`.
    #[must_use]
    pub fn with_store(self, store: GuardStore) -> Self {
        let _ = self.store.set(Some(store));
        self
    }

    /// Replace the `git rev-parse` probe.
    #[must_use]
    pub fn with_branch_probe(self, probe: impl BranchProbe + 'static) -> Self {
        let _ = self.probe.set(Box::new(probe));
        self
    }

    /// Take session, tool-use id, and working directory from the event.
    pub fn bind_event(&mut self, input: &HookInput) {
        self.session_id = input.session_id.clone().filter(|id| !id.is_empty());
        self.tool_use_id = input.tool_use_id.clone().filter(|id| !id.is_empty());
        self.cwd = input.cwd.clone();
    }

    /// Directory relative paths resolve against.
    pub fn working_dir(&self) -> PathBuf {
        self.cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn manifest_limits(&self) -> ManifestLimits {
        ManifestLimits::for_cwd(&self.working_dir(), self.config.max_manifest_bytes)
    }

    pub fn branch_probe(&self) -> &dyn BranchProbe {
        self.probe
            .get_or_init(|| {
                Box::new(GitBranchProbe::new(
                    self.cwd.clone(),
                    Duration::from_millis(self.config.branch_query_timeout_ms),
                ))
            })
            .as_ref()
    }

    /// The store, opened on first use. An open failure is logged once and
    /// every later call sees `None`.
    pub fn store(&self) -> Option<&GuardStore> {
        self.store
            .get_or_init(|| open_store(&self.config.db_path))
            .as_ref()
    }

    // ========================================================================
    // Audit and session memory
    // ========================================================================

    /// Append an audit event if the configured level records it.
    pub fn audit(&self, event: AuditEvent) {
        if !self.config.audit_level.records(event.action) {
            return;
        }
        let Some(store) = self.store() else {
            return;
        };
        let ids = EventIds {
            session_id: self.session_id.as_deref(),
            tool_use_id: self.tool_use_id.as_deref(),
        };
        if let Err(err) = store.log_event(ids, &event) {
            tracing::debug!(error = %err, action = %event.action, "audit write failed");
        }
    }

    /// Record this event's session as the most recent one.
    pub fn remember_session(&self) {
        let Some(session_id) = self.session_id.as_deref() else {
            return;
        };
        if let Some(store) = self.store() {
            if let Err(err) = store.remember_session(session_id) {
                tracing::debug!(error = %err, "failed to remember session id");
            }
        }
    }

    fn is_trusted(&self, rule: &str, subject: &str) -> bool {
        let Some(store) = self.store() else {
            return false;
        };
        store
            .check_trust(rule, Some(subject), self.session_id.as_deref())
            .unwrap_or_else(|err| {
                tracing::debug!(error = %err, rule, "trust lookup failed");
                false
            })
    }

    // ========================================================================
    // Findings to decisions
    // ========================================================================

    /// Turn the winning finding into the terminal decision, consulting the
    /// trust store for asks and writing the audit record.
    pub fn finalize(&self, finding: Finding) -> Decision {
        let guard_event = |action| {
            AuditEvent::new(AuditCategory::Guard, action)
                .rule(finding.rule.clone())
                .subject(finding.subject.clone())
        };
        match finding.action {
            Action::Block => {
                self.audit(guard_event(AuditAction::Blocked));
                Decision::Block {
                    rule: finding.rule.clone(),
                    message: finding.tagged_message(),
                }
            }
            Action::Ask if self.is_trusted(&finding.rule, &finding.subject) => {
                tracing::debug!(rule = %finding.rule, "ask pre-approved by trust entry");
                self.audit(guard_event(AuditAction::Trusted));
                Decision::Allow {
                    reason: format!("[trusted] {}", finding.tagged_message()),
                }
            }
            Action::Ask => {
                self.audit(guard_event(AuditAction::Ask));
                Decision::Ask {
                    rule: finding.rule.clone(),
                    reason: self.ask_reason(&finding),
                }
            }
            Action::Allow => {
                self.audit(guard_event(AuditAction::Allowed));
                Decision::Allow {
                    reason: finding.tagged_message(),
                }
            }
        }
    }

    /// Guidance, the matched text, and the command that would pre-approve it.
    fn ask_reason(&self, finding: &Finding) -> String {
        let mut reason = format!("{}\nMatched: {}", finding.tagged_message(), finding.subject);
        if self.rules.is_trustable(&finding.rule) {
            let session_hint = self
                .session_id
                .as_deref()
                .map(|id| format!(" --session-id {id}"))
                .unwrap_or_default();
            let _ = write!(
                reason,
                "\nTo trust: cmdguard trust add {} [--match <pattern>] [--scope session{session_hint}|--scope always]",
                finding.rule
            );
        }
        reason
    }
}

fn load_side_rules(path: &Path, kind: RuleKind) -> Option<Vec<crate::rules::PatternRule>> {
    match rule_file::load_rules(path, kind) {
        Ok(loaded) => Some(loaded.rules),
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "ignoring side-loaded rules");
            None
        }
    }
}

fn open_store(path: &Path) -> Option<GuardStore> {
    match GuardStore::open(path) {
        Ok(store) => Some(store),
        Err(err) => {
            tracing::debug!(error = %err, path = %path.display(), "guard store unavailable");
            None
        }
    }
}
