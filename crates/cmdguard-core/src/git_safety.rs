//! Git safety rules.
//!
//! ```text
//! command unit (mentions `git`)
//!      │
//!      ▼
//! deny predicates ───────────── match ──► block ("... FORBIDDEN")
//!      │
//!      ▼
//! git commit on protected branch? (bounded `git rev-parse`, fails open)
//!      │
//!      ▼
//! branch from trusted remote ref without earlier fetch ──► ask
//!      │
//!      ▼
//! ask predicates ─────────────── match ──► ask
//! ```
//!
//! The "fetch seen" flag is owned by the caller and threaded through every
//! unit of one command chain.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::decision::Finding;
use crate::rules::{self, Action, PredicateRule, Rule};
use crate::tokenizer::strip_env_prefix;

/// Branches nobody commits to or force-pushes directly.
pub const PROTECTED_BRANCHES: &[&str] = &["main", "master"];

/// Remote refs that are safe branch bases once fetched.
pub const TRUSTED_REMOTE_REFS: &[&str] =
    &["upstream/main", "origin/main", "upstream/master", "origin/master"];

static GIT_INVOCATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(^|\s)git\s").unwrap());
static FETCH_TRUSTED_REMOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"git\s+fetch\s+(upstream|origin)\b").unwrap());
static GIT_COMMIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*git\s+commit\b").unwrap());

static HEAD_REF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^HEAD([~^]\d*)*$").unwrap());
static COMMIT_SHA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-f]{7,40}$").unwrap());

static FORCE_LONG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)--force(\s|=|$)").unwrap());
static FORCE_SHORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)-[a-zA-Z]*f[a-zA-Z]*(\s|$)").unwrap());
static FORCE_WITH_LEASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)--force-with-lease(=\S+)?(\s|$)").unwrap());

static RESET_HARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"git\s+reset\s+(?:\S+\s+)*--hard\b").unwrap());
static PUSH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"git\s+push\b").unwrap());
static PUSH_ORIGIN_MAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"git\s+push.*origin\s+(main|master)(\s|$)").unwrap());
static BRANCH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"git\s+branch\b").unwrap());
static BRANCH_FORCE_DELETE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)-[a-zA-Z]*D[a-zA-Z]*(\s|$)").unwrap());
static BRANCH_FORCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"git\s+branch.*--force").unwrap());
static ADD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"git\s+add\b").unwrap());
static RM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"git\s+rm\b").unwrap());
static CLEAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"git\s+clean\b").unwrap());
static CLEAN_IGNORED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)-[a-zA-Z]*[xX][a-zA-Z]*(\s|$)").unwrap());

static CONFIG_GLOBAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"git\s+config\s+--global").unwrap());
static CONFIG_READ: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(--get\S*|--list|\s-l)(\s|$)").unwrap());
static STASH_DROP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"git\s+stash\s+(drop|clear)\b").unwrap());
static CHECKOUT_DASH_DASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"git\s+checkout\s+(?:\S+\s+)?--(\s|$)").unwrap());
static FILTER_BRANCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"git\s+filter-branch\b").unwrap());
static REFLOG_DELETE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"git\s+reflog\s+(delete|expire)\b").unwrap());
static REMOTE_REMOVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"git\s+remote\s+(remove|rm)\b").unwrap());

// ============================================================================
// Flag and target helpers
// ============================================================================

/// `--force` or a bundled short flag containing `f` (`-f`, `-fu`).
/// `--force-with-lease` does not count.
pub fn has_force_flag(cmd: &str) -> bool {
    FORCE_LONG.is_match(cmd) || FORCE_SHORT.is_match(cmd)
}

pub fn has_force_with_lease(cmd: &str) -> bool {
    FORCE_WITH_LEASE.is_match(cmd)
}

/// First two positional arguments after `push`: (remote, branch).
///
/// A refspec such as `+HEAD:refs/heads/main` yields its destination branch.
pub fn push_target(cmd: &str) -> (Option<&str>, Option<&str>) {
    let mut args = cmd
        .split_whitespace()
        .skip_while(|part| *part != "push")
        .skip(1)
        .filter(|part| !part.starts_with('-'));
    let remote = args.next();
    let branch = args.next().map(|refspec| {
        let dest = refspec.rsplit(':').next().unwrap_or(refspec);
        let dest = dest.trim_start_matches('+');
        dest.strip_prefix("refs/heads/").unwrap_or(dest)
    });
    (remote, branch)
}

/// True if a sub-command fetches from a trusted remote.
pub fn is_fetch_from_trusted_remote(cmd: &str) -> bool {
    FETCH_TRUSTED_REMOTE.is_match(cmd)
}

// ============================================================================
// Branch creation
// ============================================================================

/// A parsed branch-creation command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchCreation<'a> {
    pub name: &'a str,
    pub start_point: Option<&'a str>,
}

/// Recognize `git switch -c`, `git checkout -b/-B` and
/// `git worktree add <path> -b`. `None` when the command creates no branch
/// or is malformed.
pub fn parse_branch_creation(cmd: &str) -> Option<BranchCreation<'_>> {
    let parts: Vec<&str> = strip_env_prefix(cmd).split_whitespace().collect();
    if parts.len() < 3 || parts[0] != "git" {
        return None;
    }

    let (name, next) = match parts[1] {
        "switch" => find_flag_branch(&parts, 2, &["-c", "--create"], Some("--create="))?,
        "checkout" => find_flag_branch(&parts, 2, &["-b", "-B"], None)?,
        "worktree" if parts[2] == "add" => find_worktree_branch(&parts)?,
        _ => return None,
    };

    Some(BranchCreation {
        name,
        start_point: next_positional(&parts, next),
    })
}

/// Scan from `start` for a creation flag. A positional argument before the
/// flag means this is not a creation; a flag with no name is malformed.
fn find_flag_branch<'a>(
    parts: &[&'a str],
    start: usize,
    flags: &[&str],
    equals_prefix: Option<&str>,
) -> Option<(&'a str, usize)> {
    let mut i = start;
    while i < parts.len() {
        let arg = parts[i];
        if let Some(name) = equals_prefix.and_then(|prefix| arg.strip_prefix(prefix)) {
            return Some((name, i + 1));
        }
        if flags.contains(&arg) {
            return parts.get(i + 1).map(|name| (*name, i + 2));
        }
        if !arg.starts_with('-') {
            return None;
        }
        i += 1;
    }
    None
}

/// `git worktree add [opts] <path> [opts] -b <name> [<start>]`; a second
/// positional before `-b` is ambiguous and not treated as a creation.
fn find_worktree_branch<'a>(parts: &[&'a str]) -> Option<(&'a str, usize)> {
    let mut path_seen = false;
    let mut i = 3;
    while i < parts.len() {
        let arg = parts[i];
        if arg == "-b" {
            return parts.get(i + 1).map(|name| (*name, i + 2));
        }
        if !arg.starts_with('-') {
            if path_seen {
                return None;
            }
            path_seen = true;
        }
        i += 1;
    }
    None
}

fn next_positional<'a>(parts: &[&'a str], start: usize) -> Option<&'a str> {
    parts
        .iter()
        .skip(start)
        .find(|part| !part.starts_with('-'))
        .copied()
}

/// Trusted remote refs, `HEAD`-relative refs and commit hashes are safe bases.
///
/// An explicit `HEAD` is treated as intentional even though it behaves like
/// omitting the start point.
pub fn is_safe_start_point(reference: &str) -> bool {
    TRUSTED_REMOTE_REFS.contains(&reference)
        || HEAD_REF.is_match(reference)
        || COMMIT_SHA.is_match(reference)
}

fn is_branch_without_base(cmd: &str) -> bool {
    parse_branch_creation(cmd).is_some_and(|b| b.start_point.is_none())
}

fn is_branch_from_local_main(cmd: &str) -> bool {
    parse_branch_creation(cmd)
        .and_then(|b| b.start_point)
        .is_some_and(|start| PROTECTED_BRANCHES.contains(&start))
}

fn is_branch_from_non_upstream(cmd: &str) -> bool {
    parse_branch_creation(cmd)
        .and_then(|b| b.start_point)
        .is_some_and(|start| !is_safe_start_point(start))
}

// ============================================================================
// Rule tables
// ============================================================================

fn deny(name: &'static str, predicate: fn(&str) -> bool, message: &'static str) -> Rule {
    Rule::from(PredicateRule {
        name,
        predicate,
        message,
        action: Action::Block,
    })
}

fn ask(name: &'static str, predicate: fn(&str) -> bool, message: &'static str) -> Rule {
    Rule::from(PredicateRule {
        name,
        predicate,
        message,
        action: Action::Ask,
    })
}

static DENY_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        deny(
            "reset-hard",
            |cmd| RESET_HARD.is_match(cmd),
            "git reset --hard is FORBIDDEN. Use 'git reset --mixed' or 'git stash' to preserve changes.",
        ),
        deny(
            "push-force",
            |cmd| PUSH.is_match(cmd) && has_force_flag(cmd),
            "Force push (--force/-f) is FORBIDDEN. Use --force-with-lease for safer force pushing.",
        ),
        deny(
            "push-upstream",
            |cmd| PUSH.is_match(cmd) && push_target(cmd).0 == Some("upstream"),
            "Pushing to upstream is FORBIDDEN. Push to origin and create a PR instead.",
        ),
        deny(
            "fwl-main",
            |cmd| {
                PUSH.is_match(cmd)
                    && has_force_with_lease(cmd)
                    && push_target(cmd)
                        .1
                        .is_some_and(|branch| PROTECTED_BRANCHES.contains(&branch))
            },
            "--force-with-lease to main/master is FORBIDDEN. Use feature branches for rebasing.",
        ),
        deny(
            "branch-D",
            |cmd| BRANCH.is_match(cmd) && BRANCH_FORCE_DELETE.is_match(cmd),
            "git branch -D is FORBIDDEN. Use 'git branch -d' for safe deletion of merged branches.",
        ),
        deny(
            "branch-force",
            |cmd| BRANCH_FORCE.is_match(cmd),
            "git branch --force is FORBIDDEN. Force operations on branches must be done manually.",
        ),
        deny(
            "push-origin-main",
            |cmd| {
                PUSH_ORIGIN_MAIN.is_match(cmd)
                    || (PUSH.is_match(cmd)
                        && push_target(cmd).0 == Some("origin")
                        && push_target(cmd)
                            .1
                            .is_some_and(|branch| PROTECTED_BRANCHES.contains(&branch)))
            },
            "Pushing directly to origin/main or origin/master is FORBIDDEN. Use feature branches and PRs.",
        ),
        deny(
            "no-verify",
            |cmd| GIT_INVOCATION.is_match(cmd) && cmd.contains("--no-verify"),
            "--no-verify flag is FORBIDDEN. Git hooks must run for all commits and pushes.",
        ),
        deny(
            "add-force",
            |cmd| ADD.is_match(cmd) && has_force_flag(cmd),
            "git add --force is FORBIDDEN. Files are gitignored for a reason.",
        ),
        deny(
            "rm-cached-force",
            |cmd| RM.is_match(cmd) && cmd.contains("--cached") && has_force_flag(cmd),
            "git rm --cached --force is FORBIDDEN. Use 'git rm --cached' without --force.",
        ),
        deny(
            "rm-unsafe",
            |cmd| RM.is_match(cmd) && !cmd.contains("--cached"),
            "git rm is FORBIDDEN (deletes files). Use 'git rm --cached' to unstage only.",
        ),
        deny(
            "clean-ignored",
            |cmd| CLEAN.is_match(cmd) && CLEAN_IGNORED.is_match(cmd),
            "git clean with -x or -X is FORBIDDEN. These delete ignored/untracked files irreversibly.",
        ),
        deny(
            "branch-no-base",
            is_branch_without_base,
            "Branch creation without a start-point defaults to HEAD (which may be stale or \
             another feature branch). Specify a base: git switch -c <name> upstream/main",
        ),
    ]
});

static ASK_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        ask(
            "config-global-write",
            |cmd| CONFIG_GLOBAL.is_match(cmd) && !CONFIG_READ.is_match(cmd),
            "git config --global modifications require permission. Read operations (--get, --list) are allowed.",
        ),
        ask(
            "stash-drop",
            |cmd| STASH_DROP.is_match(cmd),
            "git stash drop/clear permanently deletes stashes. Confirm this is intentional.",
        ),
        ask(
            "checkout-dash-dash",
            |cmd| CHECKOUT_DASH_DASH.is_match(cmd),
            "git checkout -- discards working-tree changes. Consider 'git restore' or 'git stash' instead.",
        ),
        ask(
            "filter-branch",
            |cmd| FILTER_BRANCH.is_match(cmd),
            "git filter-branch is dangerous and deprecated. Use git-filter-repo if truly needed.",
        ),
        ask(
            "reflog-delete-expire",
            |cmd| REFLOG_DELETE.is_match(cmd),
            "git reflog delete/expire removes recovery points. Confirm this is intentional.",
        ),
        ask(
            "remote-remove",
            |cmd| REMOTE_REMOVE.is_match(cmd),
            "Removing a git remote may break workflows. Confirm this is intentional.",
        ),
        ask(
            "branch-from-local-main",
            is_branch_from_local_main,
            "Local main may be stale. Prefer upstream/main or run git fetch upstream main first.",
        ),
        ask(
            "branch-from-non-upstream",
            is_branch_from_non_upstream,
            "Branching from a non-upstream ref risks branch stacking. Use upstream/main instead.",
        ),
    ]
});

pub const BRANCH_NEEDS_FETCH: &str = "branch-needs-fetch";
const BRANCH_NEEDS_FETCH_MESSAGE: &str = "No git fetch detected in this command chain. \
     Fetch first: git fetch upstream main && git switch -c <name> upstream/main";

pub const COMMIT_TO_PROTECTED: &str = "commit-to-main";

/// The hard-deny table, also enforced under full bypass.
pub fn deny_rules() -> &'static [Rule] {
    &DENY_RULES
}

/// Names of every ask-type git rule, all of which are trustable.
pub fn ask_rule_names() -> Vec<&'static str> {
    std::iter::once(BRANCH_NEEDS_FETCH)
        .chain(ASK_RULES.iter().map(Rule::name))
        .collect()
}

// ============================================================================
// Current branch probe
// ============================================================================

/// Source of the repository's current branch name.
pub trait BranchProbe {
    /// `None` whenever the branch cannot be determined.
    fn current_branch(&self) -> Option<String>;
}

/// A probe with a fixed answer.
#[derive(Debug, Clone, Default)]
pub struct FixedBranch(pub Option<String>);

impl BranchProbe for FixedBranch {
    fn current_branch(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Runs `git rev-parse --abbrev-ref HEAD`, killing it after `timeout`.
#[derive(Debug, Clone)]
pub struct GitBranchProbe {
    dir: Option<PathBuf>,
    timeout: Duration,
}

const PROBE_POLL_INTERVAL: Duration = Duration::from_millis(10);

impl GitBranchProbe {
    pub fn new(dir: Option<PathBuf>, timeout: Duration) -> Self {
        Self { dir, timeout }
    }
}

impl BranchProbe for GitBranchProbe {
    fn current_branch(&self) -> Option<String> {
        let mut command = Command::new("git");
        command
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::debug!(error = %err, "cannot spawn git for branch probe");
                return None;
            }
        };

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => break,
                Ok(Some(_)) => return None,
                Ok(None) if Instant::now() >= deadline => {
                    tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "branch probe timed out");
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                Ok(None) => std::thread::sleep(PROBE_POLL_INTERVAL),
                Err(err) => {
                    tracing::debug!(error = %err, "branch probe wait failed");
                    return None;
                }
            }
        }

        let mut output = String::new();
        child.stdout.take()?.read_to_string(&mut output).ok()?;
        let branch = output.trim();
        (!branch.is_empty()).then(|| branch.to_string())
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// Run every git check on one command unit, in order.
pub fn check_git_safety(cmd: &str, fetch_seen: bool, probe: &dyn BranchProbe) -> Option<Finding> {
    if !GIT_INVOCATION.is_match(cmd) {
        return None;
    }

    if let Some(matched) = rules::evaluate(cmd, deny_rules(), &[]) {
        return Some(Finding::from_match(matched, cmd));
    }

    if GIT_COMMIT.is_match(strip_env_prefix(cmd)) {
        if let Some(branch) = probe.current_branch() {
            if PROTECTED_BRANCHES.contains(&branch.as_str()) {
                return Some(Finding::new(
                    COMMIT_TO_PROTECTED,
                    Action::Block,
                    format!(
                        "Committing directly to {branch} is FORBIDDEN. \
                         Create a feature branch: git switch -c feature/name"
                    ),
                    cmd,
                ));
            }
        }
    }

    if !fetch_seen {
        let from_trusted_remote = parse_branch_creation(cmd)
            .and_then(|b| b.start_point)
            .is_some_and(|start| TRUSTED_REMOTE_REFS.contains(&start));
        if from_trusted_remote {
            return Some(Finding::new(
                BRANCH_NEEDS_FETCH,
                Action::Ask,
                BRANCH_NEEDS_FETCH_MESSAGE,
                cmd,
            ));
        }
    }

    rules::evaluate(cmd, &ASK_RULES, &[]).map(|matched| Finding::from_match(matched, cmd))
}
