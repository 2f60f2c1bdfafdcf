//! Rule engine: ordered tables of pattern and predicate rules.
//!
//! ```text
//! command unit
//!      │
//!      ▼
//! for rule in table (skip names in skip set)
//!      │ pattern / predicate matches
//!      ▼
//! exception matches raw command? ── yes ──► next rule
//!      │ no
//!      ▼
//! RuleMatch { rule, action, message }   (first match wins)
//! ```
//!
//! Pattern rules compile with `fancy_regex` so built-in and side-loaded
//! patterns may use lookaround.

use std::collections::BTreeSet;
use std::fmt;

use fancy_regex::Regex as FancyRegex;
use serde::{Deserialize, Serialize};

use crate::tokenizer::strip_env_prefix;

// ============================================================================
// Actions
// ============================================================================

/// What a matching rule asks the host to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Refuse the invocation.
    Block,
    /// Require user confirmation (trust may pre-approve).
    Ask,
    /// Approve without prompting.
    Allow,
}

impl Default for Action {
    fn default() -> Self {
        Self::Block
    }
}

impl Action {
    /// Strict parse; `None` for anything but `block`, `ask`, `allow`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "block" => Some(Self::Block),
            "ask" => Some(Self::Ask),
            "allow" => Some(Self::Allow),
            _ => None,
        }
    }

    /// Parse, failing closed to [`Action::Block`] on unrecognized values.
    pub fn parse_or_block(value: &str) -> Self {
        Self::parse(value).unwrap_or(Self::Block)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Ask => "ask",
            Self::Allow => "allow",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Rules
// ============================================================================

/// Which form of the command a pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTarget {
    /// The command exactly as given.
    Raw,
    /// The command with leading `KEY=value` assignments removed.
    EnvStripped,
}

impl MatchTarget {
    /// Anchored patterns describe a command name, so they see the
    /// env-stripped form; unanchored ones search the raw text.
    pub fn for_pattern(pattern: &str) -> Self {
        if pattern.starts_with('^') {
            Self::EnvStripped
        } else {
            Self::Raw
        }
    }
}

/// A regex rule with an optional exception.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub name: String,
    pub pattern: FancyRegex,
    pub exception: Option<FancyRegex>,
    pub message: String,
    pub action: Action,
    pub target: MatchTarget,
}

impl PatternRule {
    /// Compile a rule; the match target follows the pattern's anchoring.
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        exception: Option<&str>,
        message: impl Into<String>,
        action: Action,
    ) -> Result<Self, fancy_regex::Error> {
        Ok(Self {
            name: name.into(),
            pattern: FancyRegex::new(pattern)?,
            exception: exception.map(FancyRegex::new).transpose()?,
            message: message.into(),
            action,
            target: MatchTarget::for_pattern(pattern),
        })
    }

    fn matches(&self, command: &str) -> bool {
        let subject = match self.target {
            MatchTarget::Raw => command,
            MatchTarget::EnvStripped => strip_env_prefix(command),
        };
        if !search(&self.pattern, subject) {
            return false;
        }
        !self
            .exception
            .as_ref()
            .is_some_and(|exception| search(exception, command))
    }
}

/// Backtracking-limit errors count as "no match".
fn search(regex: &FancyRegex, text: &str) -> bool {
    regex.is_match(text).unwrap_or_else(|err| {
        tracing::debug!(pattern = %regex.as_str(), error = %err, "regex evaluation failed");
        false
    })
}

/// A rule whose condition is code rather than a single regex.
#[derive(Debug, Clone, Copy)]
pub struct PredicateRule {
    pub name: &'static str,
    pub predicate: fn(&str) -> bool,
    pub message: &'static str,
    pub action: Action,
}

/// Any rule the engine can evaluate.
#[derive(Debug, Clone)]
pub enum Rule {
    Pattern(PatternRule),
    Predicate(PredicateRule),
}

impl Rule {
    pub fn name(&self) -> &str {
        match self {
            Self::Pattern(rule) => &rule.name,
            Self::Predicate(rule) => rule.name,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Self::Pattern(rule) => rule.action,
            Self::Predicate(rule) => rule.action,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Pattern(rule) => &rule.message,
            Self::Predicate(rule) => rule.message,
        }
    }

    pub fn matches(&self, command: &str) -> bool {
        match self {
            Self::Pattern(rule) => rule.matches(command),
            Self::Predicate(rule) => (rule.predicate)(command),
        }
    }
}

impl From<PatternRule> for Rule {
    fn from(rule: PatternRule) -> Self {
        Self::Pattern(rule)
    }
}

impl From<PredicateRule> for Rule {
    fn from(rule: PredicateRule) -> Self {
        Self::Predicate(rule)
    }
}

/// The first rule that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleMatch<'a> {
    pub rule: &'a str,
    pub action: Action,
    pub message: &'a str,
}

/// Evaluate `command` against `rules` in order; first match wins.
pub fn evaluate<'a>(command: &str, rules: &'a [Rule], skip: &[&str]) -> Option<RuleMatch<'a>> {
    rules
        .iter()
        .filter(|rule| !skip.contains(&rule.name()))
        .find(|rule| rule.matches(command))
        .map(|rule| RuleMatch {
            rule: rule.name(),
            action: rule.action(),
            message: rule.message(),
        })
}

// ============================================================================
// Built-in tool-selection rules
// ============================================================================

/// Rules that redirect to a native tool; not re-applied to later pipe
/// segments, where the command is consuming piped input instead of a file.
pub const PIPE_EXEMPT_RULES: &[&str] = &[
    "cat-file",
    "head-file",
    "tail-file",
    "grep",
    "rg",
    "find-name",
    "ls-dir",
    "sed-i",
    "awk-redir",
    "echo-redir",
    "cat-heredoc",
    "echo-noop",
    "printf-noop",
];

struct BuiltinRule {
    name: &'static str,
    pattern: &'static str,
    exception: Option<&'static str>,
    message: &'static str,
}

const UV_RUN: Option<&str> = Some(r"^\s*uv\s+run");
const UVX_OR_UV_RUN: Option<&str> = Some(r"^\s*(uvx|uv\s+run)");

const BUILTIN_COMMAND_RULES: &[BuiltinRule] = &[
    BuiltinRule {
        name: "cat-file",
        pattern: r"^\s*cat\s+(?!<<)\S",
        exception: Some(r"\|"),
        message: "Use the Read tool instead of cat.",
    },
    BuiltinRule {
        name: "head-file",
        pattern: r"^\s*head\s+",
        exception: Some(r"\|"),
        message: "Use the Read tool with a limit instead of head.",
    },
    BuiltinRule {
        name: "tail-file",
        pattern: r"^\s*tail\s+",
        exception: Some(r"\|"),
        message: "Use the Read tool with an offset instead of tail.",
    },
    BuiltinRule {
        name: "grep",
        pattern: r"^\s*grep\b",
        exception: None,
        message: "Use the Grep tool instead of grep.",
    },
    BuiltinRule {
        name: "rg",
        pattern: r"^\s*rg\b",
        exception: None,
        message: "Use the Grep tool instead of rg.",
    },
    BuiltinRule {
        name: "find-name",
        pattern: r"^\s*find\b.*-name",
        exception: None,
        message: "Use the Glob tool instead of find -name.",
    },
    BuiltinRule {
        name: "ls-dir",
        pattern: r"^\s*ls\s",
        exception: Some(r"\|"),
        message: "Use the Glob tool instead of ls.",
    },
    BuiltinRule {
        name: "sed-i",
        pattern: r"^\s*sed\b.*\s-i",
        exception: None,
        message: "Use the Edit tool instead of sed -i.",
    },
    BuiltinRule {
        name: "awk-redir",
        pattern: r"^\s*awk\b.*>\s*\S",
        exception: None,
        message: "Use the Write or Edit tool instead of awk with redirection.",
    },
    BuiltinRule {
        name: "echo-redir",
        pattern: r"^\s*(echo|printf)\b.*[^2]>\s*[^&/\s]",
        exception: Some(r">\s*/dev/"),
        message: "Use the Write tool instead of echo/printf redirection.",
    },
    BuiltinRule {
        name: "cat-heredoc",
        pattern: r"^\s*cat\s*<<",
        exception: None,
        message: "Use the Write tool instead of cat heredoc.",
    },
    BuiltinRule {
        name: "pager",
        pattern: r"^\s*(less|more)\b",
        exception: None,
        message: "Pagers are interactive and will hang. Use the Read tool or pipe through head.",
    },
    BuiltinRule {
        name: "editor",
        pattern: r"^\s*(nano|vim|vi|emacs)\b",
        exception: None,
        message: "Interactive editors will hang. Use the Edit or Write tool.",
    },
    BuiltinRule {
        name: "python-json",
        pattern: r"^\s*python3?\s+-c\s+.*\bjson\b",
        exception: UV_RUN,
        message: "Use jq for JSON processing instead of python -c.",
    },
    BuiltinRule {
        name: "python",
        pattern: r"^\s*python3?\s",
        exception: UV_RUN,
        message: "Use `uv run python` instead of bare python.",
    },
    BuiltinRule {
        name: "pip",
        pattern: r"^\s*pip3?\s+\w",
        exception: None,
        message: "Use `uv add` / `uv pip` instead of pip.",
    },
    BuiltinRule {
        name: "pytest",
        pattern: r"^\s*pytest\b",
        exception: UVX_OR_UV_RUN,
        message: "Use `make py-test` or `uv run pytest` instead of bare pytest.",
    },
    BuiltinRule {
        name: "black",
        pattern: r"^\s*black\b",
        exception: UVX_OR_UV_RUN,
        message: "Use `make py-format` or `uv run ruff format` instead of black.",
    },
    BuiltinRule {
        name: "ruff",
        pattern: r"^\s*ruff\b",
        exception: UVX_OR_UV_RUN,
        message: "Use `make py-lint` or `uv run ruff` instead of bare ruff.",
    },
    BuiltinRule {
        name: "mypy",
        pattern: r"^\s*mypy\b",
        exception: UVX_OR_UV_RUN,
        message: "Use `make py-lint` or `uv run mypy` instead of bare mypy.",
    },
    BuiltinRule {
        name: "pyright",
        pattern: r"^\s*pyright\b",
        exception: UVX_OR_UV_RUN,
        message: "Use `make py-lint` or `uv run pyright` instead of bare pyright.",
    },
    BuiltinRule {
        name: "pre-commit",
        pattern: r"^\s*(uvx\s+|uv\s+run\s+)?pre-commit\b",
        exception: None,
        message: "Use `make lint` instead of invoking pre-commit directly.",
    },
    BuiltinRule {
        name: "prek",
        pattern: r"^\s*(uvx\s+)?prek\b",
        exception: Some(r"^\s*make\b"),
        message: "Use `make lint` instead of invoking prek directly.",
    },
    BuiltinRule {
        name: "ipython",
        pattern: r"^\s*ipython\b",
        exception: None,
        message: "IPython is interactive and will hang. Use `uv run python script.py`.",
    },
    BuiltinRule {
        name: "tox",
        pattern: r"^\s*tox\b",
        exception: None,
        message: "Use `make py-test` instead of tox.",
    },
    BuiltinRule {
        name: "isort",
        pattern: r"^\s*isort\b",
        exception: None,
        message: "Use `uv run ruff check --select I --fix` instead of isort.",
    },
    BuiltinRule {
        name: "flake8",
        pattern: r"^\s*flake8\b",
        exception: None,
        message: "Use `uv run ruff check` instead of flake8.",
    },
    BuiltinRule {
        name: "cargo-lint",
        pattern: r"^\s*cargo\s+(check|clippy|fmt)\b",
        exception: None,
        message: "Use `make lint` instead of cargo check/clippy/fmt.",
    },
    BuiltinRule {
        name: "cargo-test",
        pattern: r"^\s*cargo\s+(test|nextest)\b",
        exception: None,
        message: "Use `make test` instead of cargo test.",
    },
    BuiltinRule {
        name: "cargo-build",
        pattern: r"^\s*cargo\s+build\b",
        exception: None,
        message: "Use `make build` instead of cargo build.",
    },
    BuiltinRule {
        name: "bash-script",
        pattern: r"^\s*(bash|sh)\s+\S+\.sh\b",
        exception: Some(r"^\s*(bash|sh)\s+-"),
        message: "Use a make target instead of running shell scripts directly.",
    },
    BuiltinRule {
        name: "direct-script",
        pattern: r"^\s*[\w.~/-]+\.sh\b",
        exception: None,
        message: "Use a make target instead of running shell scripts directly.",
    },
    BuiltinRule {
        name: "tmp-path",
        pattern: r"/tmp/",
        exception: Some(r"hack/tmp"),
        message: "Use the project's hack/tmp/ directory instead of /tmp/.",
    },
    BuiltinRule {
        name: "echo-noop",
        pattern: r#"^\s*echo\s+(['"].*['"]|[^|>&;$`]+)\s*$"#,
        exception: None,
        message: "Output text directly in your response instead of running echo.",
    },
    BuiltinRule {
        name: "printf-noop",
        pattern: r#"^\s*printf\s+(['"].*['"]|[^|>&;$`]+)\s*$"#,
        exception: None,
        message: "Output text directly in your response instead of running printf.",
    },
    BuiltinRule {
        name: "git-rebase-i",
        pattern: r"^\s*git\s+rebase\s+.*(-i\b|--interactive\b)",
        exception: None,
        message: "Interactive rebase will hang. Use non-interactive git commands.",
    },
    BuiltinRule {
        name: "git-add-interactive",
        pattern: r"^\s*git\s+add\s+.*(-[pi]\b|--patch\b|--interactive\b)",
        exception: None,
        message: "Interactive git add will hang. Stage explicit paths instead.",
    },
];

/// Compile the built-in tool-selection table.
pub fn builtin_command_rules() -> Vec<Rule> {
    BUILTIN_COMMAND_RULES
        .iter()
        .map(|spec| {
            PatternRule::new(
                spec.name,
                spec.pattern,
                spec.exception,
                spec.message,
                Action::Block,
            )
            .map(Rule::from)
            .unwrap_or_else(|err| panic!("built-in rule {} does not compile: {err}", spec.name))
        })
        .collect()
}

// ============================================================================
// Rule set
// ============================================================================

/// Every table the dispatcher consults, built once per process.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub command_rules: Vec<Rule>,
    pub url_rules: Vec<Rule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RuleSet {
    /// Built-in command and URL tables.
    pub fn builtin() -> Self {
        Self {
            command_rules: builtin_command_rules(),
            url_rules: crate::fetch_guard::builtin_url_rules(),
        }
    }

    /// Append side-loaded command rules after the built-ins.
    #[must_use]
    pub fn with_extra_command_rules(mut self, extra: Vec<PatternRule>) -> Self {
        self.command_rules.extend(extra.into_iter().map(Rule::from));
        self
    }

    /// Append side-loaded URL rules after the built-ins.
    #[must_use]
    pub fn with_extra_url_rules(mut self, extra: Vec<PatternRule>) -> Self {
        self.url_rules.extend(extra.into_iter().map(Rule::from));
        self
    }

    /// Rule names that may carry a trust entry: every ask-type rule.
    pub fn trustable_rule_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = crate::git_safety::ask_rule_names()
            .into_iter()
            .chain(crate::cluster_risk::ASK_RULE_NAMES.iter().copied())
            .map(str::to_string)
            .collect();
        names.extend(
            self.command_rules
                .iter()
                .chain(&self.url_rules)
                .filter(|rule| rule.action() == Action::Ask)
                .map(|rule| rule.name().to_string()),
        );
        names
    }

    pub fn is_trustable(&self, rule: &str) -> bool {
        self.trustable_rule_names().contains(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin_match(command: &str) -> Option<&'static str> {
        static RULES: std::sync::LazyLock<Vec<Rule>> =
            std::sync::LazyLock::new(builtin_command_rules);
        evaluate(command, &RULES, &[]).map(|m| m.rule)
    }

    // ========================================================================
    // Actions
    // ========================================================================

    #[test]
    fn unknown_action_fails_closed() {
        assert_eq!(Action::parse_or_block("ask"), Action::Ask);
        assert_eq!(Action::parse_or_block("allow"), Action::Allow);
        assert_eq!(Action::parse_or_block("warn"), Action::Block);
        assert_eq!(Action::parse_or_block(""), Action::Block);
        assert_eq!(Action::parse("Block"), None);
    }

    #[test]
    fn action_serde_is_snake_case() {
        assert_eq!(serde_json::to_string(&Action::Ask).unwrap(), "\"ask\"");
    }

    // ========================================================================
    // Engine
    // ========================================================================

    #[test]
    fn first_match_wins_in_table_order() {
        let rules: Vec<Rule> = vec![
            PatternRule::new("first", r"foo", None, "one", Action::Ask)
                .unwrap()
                .into(),
            PatternRule::new("second", r"foo", None, "two", Action::Block)
                .unwrap()
                .into(),
        ];
        let m = evaluate("foo", &rules, &[]).unwrap();
        assert_eq!(m.rule, "first");
        assert_eq!(m.action, Action::Ask);
    }

    #[test]
    fn skip_set_hides_rules() {
        let rules: Vec<Rule> = vec![
            PatternRule::new("first", r"foo", None, "one", Action::Ask)
                .unwrap()
                .into(),
            PatternRule::new("second", r"foo", None, "two", Action::Block)
                .unwrap()
                .into(),
        ];
        assert_eq!(evaluate("foo", &rules, &["first"]).unwrap().rule, "second");
        assert!(evaluate("foo", &rules, &["first", "second"]).is_none());
    }

    #[test]
    fn exception_is_checked_against_raw_command() {
        let rule = PatternRule::new("x", r"^\s*make\b", Some(r"^DRY=1"), "m", Action::Block)
            .unwrap();
        assert_eq!(rule.target, MatchTarget::EnvStripped);
        let rules = vec![Rule::from(rule)];
        assert!(evaluate("CC=clang make all", &rules, &[]).is_some());
        assert!(evaluate("DRY=1 make all", &rules, &[]).is_none());
    }

    #[test]
    fn predicate_rules_share_the_engine() {
        let rules = vec![Rule::from(PredicateRule {
            name: "long",
            predicate: |cmd| cmd.len() > 5,
            message: "too long",
            action: Action::Ask,
        })];
        assert!(evaluate("short", &rules, &[]).is_none());
        let m = evaluate("much longer", &rules, &[]).unwrap();
        assert_eq!((m.rule, m.message), ("long", "too long"));
    }

    // ========================================================================
    // Built-in tool-selection table
    // ========================================================================

    #[test]
    fn builtin_names_are_unique() {
        let rules = builtin_command_rules();
        let names: BTreeSet<&str> = rules.iter().map(Rule::name).collect();
        assert_eq!(names.len(), rules.len());
        for exempt in PIPE_EXEMPT_RULES {
            assert!(names.contains(exempt), "{exempt} missing from table");
        }
    }

    #[test]
    fn native_tool_redirections() {
        assert_eq!(builtin_match("cat file.py"), Some("cat-file"));
        assert_eq!(builtin_match("cat <<EOF"), Some("cat-heredoc"));
        assert_eq!(builtin_match("head -n 5 f"), Some("head-file"));
        assert_eq!(builtin_match("grep -r foo ."), Some("grep"));
        assert_eq!(builtin_match("find . -name '*.rs'"), Some("find-name"));
        assert_eq!(builtin_match("ls -la src"), Some("ls-dir"));
        assert_eq!(builtin_match("sed -i 's/a/b/' f"), Some("sed-i"));
        assert_eq!(builtin_match("echo hi > out.txt"), Some("echo-redir"));
    }

    #[test]
    fn pipe_exceptions_allow_piped_forms() {
        assert_eq!(builtin_match("cat file | wc -l"), None);
        assert_eq!(builtin_match("ls | wc -l"), None);
    }

    #[test]
    fn stderr_and_dev_redirects_are_not_writes() {
        assert_eq!(builtin_match("echo hi > /dev/null 2>&1 && true"), None);
    }

    #[test]
    fn echo_noop_only_for_plain_text() {
        assert_eq!(builtin_match("echo \"done\""), Some("echo-noop"));
        assert_eq!(builtin_match("echo $HOME"), None);
    }

    #[test]
    fn env_prefix_does_not_hide_command_name() {
        assert_eq!(builtin_match("PYTHONPATH=. python3 x.py"), Some("python"));
        assert_eq!(builtin_match("FOO=bar make build"), None);
    }

    #[test]
    fn uv_run_exempts_python_tooling() {
        assert_eq!(builtin_match("uv run python x.py"), None);
        assert_eq!(builtin_match("uv run pytest -q"), None);
        assert_eq!(builtin_match("pytest -q"), Some("pytest"));
        assert_eq!(builtin_match("python3 -c 'import json'"), Some("python-json"));
    }

    #[test]
    fn interactive_tools_are_blocked() {
        assert_eq!(builtin_match("less README.md"), Some("pager"));
        assert_eq!(builtin_match("vim src/lib.rs"), Some("editor"));
        assert_eq!(builtin_match("git rebase -i HEAD~3"), Some("git-rebase-i"));
        assert_eq!(builtin_match("git add -p src"), Some("git-add-interactive"));
        assert_eq!(builtin_match("git add src/lib.rs"), None);
    }

    #[test]
    fn scratch_paths() {
        assert_eq!(builtin_match("touch /tmp/x"), Some("tmp-path"));
        assert_eq!(builtin_match("touch hack/tmp/x"), None);
    }

    #[test]
    fn ordinary_commands_pass() {
        for cmd in ["make build", "git status", "docker ps", "jq . f.json"] {
            assert_eq!(builtin_match(cmd), None, "{cmd}");
        }
    }

    // ========================================================================
    // Rule set
    // ========================================================================

    #[test]
    fn trustable_names_cover_ask_rules_only() {
        let extra = PatternRule::new("deploy", r"^\s*deploy\b", None, "confirm", Action::Ask)
            .unwrap();
        let blocked = PatternRule::new("nuke", r"^\s*nuke\b", None, "no", Action::Block).unwrap();
        let set = RuleSet::builtin().with_extra_command_rules(vec![extra, blocked]);
        let names = set.trustable_rule_names();
        assert!(names.contains("deploy"));
        assert!(names.contains("stash-drop"));
        assert!(names.contains("branch-needs-fetch"));
        assert!(names.contains("cluster-critical"));
        assert!(!names.contains("nuke"));
        assert!(!names.contains("reset-hard"));
        assert!(!names.contains("cat-file"));
    }
}
