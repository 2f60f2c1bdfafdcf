//! Hook event dispatch.
//!
//! ```text
//! HookInput ──► PostToolUse? ──► auth-failure audit ──► no opinion
//!     │
//!     ▼
//! tool kind
//!   ├─ file write ──► /tmp path check
//!   ├─ plan mode  ──► block with planning guidance
//!   ├─ URL fetch  ──► URL rules
//!   └─ shell      ──► size cap ─► bypass prefix? ─► per chain unit:
//!                        fetch URLs, `-c` wrapper, shape checks, pipe
//!                        segments, subshell bodies, full rules, cluster risk
//! ```
//!
//! Git deny rules are scanned across the whole command before anything else,
//! so an ask or a trusted rule earlier in a chain never hides a later deny.
//! After that the first finding wins. Everything that can fail (store, git probe,
//! manifest reads) degrades to "no finding" rather than an error, so a broken
//! environment never blocks the agent. Deny rules are the exception: they
//! need nothing external and always run.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;

use crate::audit::{AuditAction, AuditCategory, AuditEvent};
use crate::cluster_risk;
use crate::context::GuardContext;
use crate::decision::{Decision, Finding};
use crate::event::{HookInput, HookPhase, ToolCall};
use crate::fetch_guard::{self, UrlOutcome, UrlVerdict};
use crate::git_safety;
use crate::rules::{self, Action};
use crate::tokenizer;

pub const OVERSIZED_COMMAND: &str = "oversized-command";
pub const SHELL_WRAPPER: &str = "shell-wrapper";
pub const PROCESS_SUBSTITUTION: &str = "process-substitution";
pub const MULTILINE_PYTHON_C: &str = "multiline-python-c";
pub const TMP_PATH_WRITE: &str = "tmp-path-write";
pub const PLAN_MODE: &str = "plan-mode";

/// Longest excerpt of a command kept in shape-check findings.
const EXCERPT_CHARS: usize = 200;

static PYTHON_DASH_C: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:uv\s+run\s+)?python3?\s+-c\s+").unwrap());

/// Decide one hook event.
pub fn dispatch(ctx: &GuardContext, input: &HookInput) -> Decision {
    ctx.remember_session();

    if input.phase() == HookPhase::PostToolUse {
        audit_fetch_response(ctx, input);
        return Decision::NoOpinion;
    }

    match input.tool_call() {
        ToolCall::Shell { command } => check_shell(ctx, command.trim()),
        ToolCall::WebFetch { url } => check_web_fetch(ctx, url.trim()),
        ToolCall::FileWrite { tool, path } => check_file_write(ctx, &tool, &path),
        ToolCall::PlanMode => ctx.finalize(Finding::new(
            PLAN_MODE,
            Action::Block,
            "Plan mode writes the whole plan in one shot. Plan incrementally instead: \
             ask clarifying questions first, then write the plan to a file section by section \
             and share research findings in the conversation for feedback.",
            "EnterPlanMode",
        )),
        ToolCall::Other { tool } => {
            tracing::trace!(tool = %tool, "tool not guarded");
            Decision::NoOpinion
        }
    }
}

// ============================================================================
// Non-shell tools
// ============================================================================

fn check_file_write(ctx: &GuardContext, tool: &str, path: &str) -> Decision {
    if !path.contains("/tmp/") || path.contains("hack/tmp") {
        return Decision::NoOpinion;
    }
    ctx.finalize(Finding::new(
        TMP_PATH_WRITE,
        Action::Block,
        format!(
            "{tool} targets {path}. Write scratch files under the project's hack/tmp/ directory instead of /tmp/."
        ),
        path,
    ))
}

fn check_web_fetch(ctx: &GuardContext, url: &str) -> Decision {
    if url.is_empty() {
        return Decision::NoOpinion;
    }
    let verdicts = fetch_guard::check_urls([url], &ctx.rules.url_rules, false);
    match first_enforced(ctx, verdicts, "WebFetch", url) {
        Some(finding) => ctx.finalize(finding),
        None => Decision::NoOpinion,
    }
}

/// Audit every verdict, then turn the enforced one (if any) into a finding.
fn first_enforced(
    ctx: &GuardContext,
    verdicts: Vec<UrlVerdict>,
    tool: &str,
    subject: &str,
) -> Option<Finding> {
    let mut enforced = None;
    for verdict in verdicts {
        ctx.audit(url_event(&verdict, tool));
        if let (Some(rule), Some(action), Some(message)) =
            (verdict.rule, verdict.action, verdict.message)
        {
            enforced.get_or_insert_with(|| Finding::new(rule, action, message, subject));
        }
    }
    enforced
}

fn url_event(verdict: &UrlVerdict, tool: &str) -> AuditEvent {
    let action = match verdict.outcome {
        UrlOutcome::Allowed => AuditAction::Allowed,
        UrlOutcome::Blocked => AuditAction::Blocked,
        UrlOutcome::Asked => AuditAction::Ask,
        UrlOutcome::Bypassed => AuditAction::Bypassed,
    };
    let mut event = AuditEvent::new(AuditCategory::Url, action)
        .subject(verdict.url.clone())
        .detail(json!({ "tool": tool, "phase": "pre" }));
    if let Some(rule) = &verdict.rule {
        event = event.rule(rule.clone());
    }
    event
}

// ============================================================================
// Shell commands
// ============================================================================

fn check_shell(ctx: &GuardContext, command: &str) -> Decision {
    if command.is_empty() {
        return Decision::NoOpinion;
    }
    if command.len() > ctx.config.max_command_len {
        tracing::debug!(len = command.len(), "command over analysis cap");
        return ctx.finalize(Finding::new(
            OVERSIZED_COMMAND,
            Action::Block,
            "Command too large for guard analysis.",
            excerpt(command, EXCERPT_CHARS),
        ));
    }

    if let Some(rest) = strip_bypass(ctx, command) {
        return check_bypassed(ctx, command, rest);
    }

    if let Some(finding) = find_deny(command) {
        return ctx.finalize(finding);
    }

    let mut fetch_seen = false;
    for unit in tokenizer::split_chain(command) {
        if let Some(finding) = check_unit(ctx, &unit, &mut fetch_seen) {
            return ctx.finalize(finding);
        }
    }

    ctx.audit(
        AuditEvent::new(AuditCategory::Guard, AuditAction::Allowed)
            .subject(command)
            .detail(json!({ "message": "Pass-through allowed" })),
    );
    Decision::NoOpinion
}

/// Command text after the bypass token, when the command starts with it.
fn strip_bypass<'a>(ctx: &GuardContext, command: &'a str) -> Option<&'a str> {
    let token = ctx.config.bypass_token.as_deref()?;
    let rest = command.strip_prefix(token)?;
    rest.starts_with(char::is_whitespace)
        .then(|| rest.trim_start())
}

/// A bypassed command skips every rule except fetch guards and git deny rules.
fn check_bypassed(ctx: &GuardContext, command: &str, rest: &str) -> Decision {
    tracing::debug!("guard bypass requested");
    ctx.audit(AuditEvent::new(AuditCategory::Bypass, AuditAction::Bypassed).subject(command));

    for unit in tokenizer::split_chain(rest) {
        if let Some(finding) = check_fetch(ctx, &unit) {
            return ctx.finalize(finding);
        }
        if let Some(finding) = deny_in_unit(&unit) {
            return ctx.finalize(finding);
        }
    }
    Decision::NoOpinion
}

/// First git deny rule matched anywhere in `command`: chain units, pipe
/// segments, `-c` inner commands and subshell bodies.
fn find_deny(command: &str) -> Option<Finding> {
    tokenizer::split_chain(command)
        .iter()
        .find_map(|unit| deny_in_unit(unit))
}

fn deny_in_unit(unit: &str) -> Option<Finding> {
    let segments = tokenizer::split_pipe(unit);
    let candidates = std::iter::once(unit).chain(segments.iter().skip(1).map(String::as_str));
    for candidate in candidates {
        let command = tokenizer::normalize(candidate);
        if let Some(matched) = rules::evaluate(command, git_safety::deny_rules(), &[]) {
            return Some(Finding::from_match(matched, command));
        }
    }

    // Inner text is always shorter than the unit, so the recursion ends.
    if let Some(inner) = tokenizer::unwrap_shell_dash_c(unit) {
        if let Some(finding) = find_deny(&inner) {
            return Some(finding);
        }
    }
    tokenizer::extract_subshell_bodies(unit)
        .iter()
        .find_map(|body| find_deny(body))
}

fn check_fetch(ctx: &GuardContext, unit: &str) -> Option<Finding> {
    let verdicts = fetch_guard::check_fetch_command(unit, &ctx.rules.url_rules);
    first_enforced(ctx, verdicts, "Bash", unit)
}

/// Every check for one chain unit, in precedence order.
fn check_unit(ctx: &GuardContext, unit: &str, fetch_seen: &mut bool) -> Option<Finding> {
    if git_safety::is_fetch_from_trusted_remote(unit) {
        *fetch_seen = true;
    }
    if let Some(finding) = check_fetch(ctx, unit) {
        return Some(finding);
    }

    if let Some(inner) = tokenizer::unwrap_shell_dash_c(unit) {
        for inner_unit in tokenizer::split_chain(&inner) {
            if git_safety::is_fetch_from_trusted_remote(&inner_unit) {
                *fetch_seen = true;
            }
            if let Some(finding) = check_rules(ctx, &inner_unit, *fetch_seen, &[]) {
                return Some(finding);
            }
        }
        return Some(Finding::new(
            SHELL_WRAPPER,
            Action::Block,
            format!(
                "Run the command directly without the `bash -c` wrapper, which causes a permission prompt. Just use: `{inner}`"
            ),
            unit,
        ));
    }

    if unit.contains("<(") {
        return Some(Finding::new(
            PROCESS_SUBSTITUTION,
            Action::Block,
            "Process substitution `<(...)` causes a permission prompt. Write each output to a file \
             under hack/tmp/ and compare the files in a separate command.",
            excerpt(unit, EXCERPT_CHARS),
        ));
    }

    if PYTHON_DASH_C.is_match(unit) && unit.contains('\n') {
        return Some(Finding::new(
            MULTILINE_PYTHON_C,
            Action::Block,
            "Multi-line `python -c` causes a permission prompt. Write the script to a file \
             and run it with `uv run python <file>`.",
            excerpt(unit, EXCERPT_CHARS),
        ));
    }

    if let Some(finding) = check_pipe_segments(ctx, unit, *fetch_seen) {
        return Some(finding);
    }

    for body in tokenizer::extract_subshell_bodies(unit) {
        if git_safety::is_fetch_from_trusted_remote(&body) {
            *fetch_seen = true;
        }
        if let Some(finding) = check_rules(ctx, &body, *fetch_seen, &[]) {
            return Some(finding);
        }
        if let Some(finding) = check_pipe_segments(ctx, &body, *fetch_seen) {
            return Some(finding);
        }
    }

    if let Some(finding) = check_rules(ctx, unit, *fetch_seen, &[]) {
        return Some(finding);
    }

    let unit = tokenizer::strip_control_keyword(unit);
    cluster_risk::check_cluster_command(unit, &ctx.working_dir(), &ctx.manifest_limits())
}

/// Segments after the first pipe, minus the rules that only make sense for
/// a command reading a file.
fn check_pipe_segments(ctx: &GuardContext, unit: &str, fetch_seen: bool) -> Option<Finding> {
    tokenizer::split_pipe(unit)
        .iter()
        .skip(1)
        .find_map(|segment| check_rules(ctx, segment, fetch_seen, rules::PIPE_EXEMPT_RULES))
}

/// Git safety first, then the pattern rules.
fn check_rules(
    ctx: &GuardContext,
    command: &str,
    fetch_seen: bool,
    skip: &[&str],
) -> Option<Finding> {
    let command = tokenizer::strip_control_keyword(command);
    if let Some(finding) = git_safety::check_git_safety(command, fetch_seen, ctx.branch_probe()) {
        return Some(finding);
    }
    rules::evaluate(command, &ctx.rules.command_rules, skip)
        .map(|matched| Finding::from_match(matched, command))
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

// ============================================================================
// Post-execution audit
// ============================================================================

/// Record whether each fetched URL came back as an auth failure.
fn audit_fetch_response(ctx: &GuardContext, input: &HookInput) {
    let (tool, urls, response) = match input.tool_call() {
        ToolCall::Shell { command } if fetch_guard::is_fetch_command(&command) => {
            let urls: Vec<String> = fetch_guard::extract_urls(&command)
                .into_iter()
                .map(str::to_string)
                .collect();
            ("Bash", urls, input.response_text())
        }
        ToolCall::WebFetch { url } if !url.trim().is_empty() => {
            ("WebFetch", vec![url.trim().to_string()], input.response_text())
        }
        _ => return,
    };

    let probe = fetch_guard::detect_auth_failure(&response);
    let action = if probe.auth_failed {
        AuditAction::AuthFailed
    } else {
        AuditAction::Success
    };
    for url in urls {
        ctx.audit(AuditEvent::new(AuditCategory::Url, action).subject(url).detail(json!({
            "tool": tool,
            "phase": "post",
            "response_code": probe.status,
            "auth_failed": probe.auth_failed,
        })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLevel;
    use crate::config::GuardConfig;
    use crate::git_safety::FixedBranch;
    use crate::rules::RuleSet;
    use crate::store::GuardStore;

    fn context_with(config: GuardConfig, branch: Option<&str>) -> GuardContext {
        GuardContext::new(config, RuleSet::builtin())
            .with_store(GuardStore::open_in_memory().unwrap())
            .with_branch_probe(FixedBranch(branch.map(str::to_string)))
    }

    fn context() -> GuardContext {
        context_with(GuardConfig::default(), Some("feat/x"))
    }

    fn bash(command: &str) -> HookInput {
        HookInput::parse(
            json!({"tool_name": "Bash", "tool_input": {"command": command}})
                .to_string()
                .as_bytes(),
        )
        .unwrap()
    }

    fn run(command: &str) -> Decision {
        dispatch(&context(), &bash(command))
    }

    fn actions(ctx: &GuardContext) -> Vec<(String, String)> {
        let mut events: Vec<_> = ctx
            .store()
            .unwrap()
            .recent_events(50)
            .unwrap()
            .into_iter()
            .map(|e| (e.category, e.action))
            .collect();
        events.reverse();
        events
    }

    // ========================================================================
    // Pattern and git rules
    // ========================================================================

    #[test]
    fn plain_commands_pass_through() {
        assert_eq!(run("make test"), Decision::NoOpinion);
        assert_eq!(run("   "), Decision::NoOpinion);
        assert_eq!(run("git status && git log --oneline"), Decision::NoOpinion);
    }

    #[test]
    fn tool_selection_rule_blocks() {
        let decision = run("cat README.md");
        assert_eq!(decision.rule(), Some("cat-file"));
        assert!(decision.is_blocked());
    }

    #[test]
    fn later_chain_unit_is_checked() {
        assert_eq!(run("cd src && grep -r foo .").rule(), Some("grep"));
    }

    #[test]
    fn pipe_segments_skip_exempt_rules() {
        assert_eq!(run("git log | grep fix"), Decision::NoOpinion);
        assert_eq!(run("git log | python3 -c 'print(1)'").rule(), Some("python"));
    }

    #[test]
    fn subshell_bodies_are_checked() {
        assert_eq!(run("echo $(git reset --hard)").rule(), Some("reset-hard"));
    }

    #[test]
    fn control_keywords_are_stripped() {
        assert_eq!(
            run("for f in a b; do cat $f; done").rule(),
            Some("cat-file")
        );
    }

    #[test]
    fn git_deny_wins_over_everything_else() {
        let decision = run("git push --force origin feat/x");
        assert!(decision.is_blocked());
        assert_eq!(decision.rule(), Some("push-force"));
    }

    #[test]
    fn deny_after_ask_in_chain_still_blocks() {
        assert!(run("git stash drop").is_ask());
        for command in [
            "git stash drop && git reset --hard HEAD~3",
            "git stash drop; git log | git push --force origin feat/x",
            "git stash drop && echo $(git reset --hard)",
            "oc delete pod x && bash -c 'git clean -fdx'",
        ] {
            let decision = run(command);
            assert!(decision.is_blocked(), "{command:?} -> {decision:?}");
        }
    }

    #[test]
    fn deny_after_tool_selection_block_reports_deny() {
        assert_eq!(
            run("cat notes.txt && git reset --hard").rule(),
            Some("reset-hard")
        );
    }

    #[test]
    fn branch_from_remote_needs_fetch_in_same_chain() {
        assert_eq!(
            run("git checkout -b feat/y upstream/main").rule(),
            Some(git_safety::BRANCH_NEEDS_FETCH)
        );
        assert_eq!(
            run("git fetch upstream && git checkout -b feat/y upstream/main"),
            Decision::NoOpinion
        );
    }

    #[test]
    fn commit_on_protected_branch_is_blocked() {
        let ctx = context_with(GuardConfig::default(), Some("main"));
        let decision = dispatch(&ctx, &bash("git commit -m wip"));
        assert_eq!(decision.rule(), Some(git_safety::COMMIT_TO_PROTECTED));
    }

    // ========================================================================
    // Shape checks
    // ========================================================================

    #[test]
    fn shell_wrapper_checks_inner_then_blocks() {
        let decision = run("bash -c 'make test'");
        assert_eq!(decision.rule(), Some(SHELL_WRAPPER));
        assert!(decision.text().unwrap().contains("Just use: `make test`"));

        assert_eq!(run("bash -c 'git reset --hard'").rule(), Some("reset-hard"));
    }

    #[test]
    fn process_substitution_is_blocked() {
        assert_eq!(
            run("diff <(ls a) <(ls b)").rule(),
            Some(PROCESS_SUBSTITUTION)
        );
    }

    #[test]
    fn multiline_python_c_is_blocked() {
        assert_eq!(
            run("uv run python -c 'import os\nprint(os.getcwd())'").rule(),
            Some(MULTILINE_PYTHON_C)
        );
        assert_eq!(run("uv run python -c 'print(1)'"), Decision::NoOpinion);
    }

    #[test]
    fn oversized_command_is_blocked() {
        let mut config = GuardConfig::default();
        config.max_command_len = 16;
        let ctx = context_with(config, None);
        let decision = dispatch(&ctx, &bash("make test-everything-now"));
        assert_eq!(decision.rule(), Some(OVERSIZED_COMMAND));
        assert!(decision.text().unwrap().contains("Command too large for guard analysis."));
    }

    // ========================================================================
    // Bypass
    // ========================================================================

    #[test]
    fn bypass_skips_tool_selection_rules() {
        let ctx = context();
        assert_eq!(
            dispatch(&ctx, &bash("GUARD_BYPASS=1 cat README.md")),
            Decision::NoOpinion
        );
        assert_eq!(actions(&ctx), vec![("bypass".into(), "bypassed".into())]);
    }

    #[test]
    fn bypass_still_enforces_git_deny_rules() {
        let decision = run("GUARD_BYPASS=1 git status && git reset --hard HEAD~1");
        assert_eq!(decision.rule(), Some("reset-hard"));
    }

    #[test]
    fn disabled_bypass_token_is_ordinary_text() {
        let config = GuardConfig::default().with_bypass_token("");
        let ctx = context_with(config, None);
        assert_eq!(
            dispatch(&ctx, &bash("GUARD_BYPASS=1 cat README.md")).rule(),
            Some("cat-file")
        );
    }

    // ========================================================================
    // URL fetches
    // ========================================================================

    #[test]
    fn curl_to_github_api_is_blocked_with_hint() {
        let decision = run("curl -s https://api.github.com/repos/o/r");
        assert_eq!(decision.rule(), Some("github-api"));
        assert!(decision.text().unwrap().contains("ALLOW_FETCH=1"));
    }

    #[test]
    fn allow_fetch_marker_bypasses_url_rules() {
        let ctx = context();
        let decision = dispatch(&ctx, &bash("ALLOW_FETCH=1 curl https://api.github.com/x"));
        assert_eq!(decision, Decision::NoOpinion);
        assert!(actions(&ctx).contains(&("url".into(), "bypassed".into())));
    }

    #[test]
    fn web_fetch_is_checked_without_bypass_hint() {
        let ctx = context();
        let input = HookInput::parse(
            br#"{"tool_name":"WebFetch","tool_input":{"url":"https://docs.google.com/document/d/1"}}"#,
        )
        .unwrap();
        let decision = dispatch(&ctx, &input);
        assert_eq!(decision.rule(), Some("google-docs"));
        assert!(!decision.text().unwrap().contains("ALLOW_FETCH"));
        assert_eq!(
            actions(&ctx),
            vec![
                ("url".into(), "blocked".into()),
                ("guard".into(), "blocked".into())
            ]
        );
    }

    #[test]
    fn post_tool_use_records_auth_failure() {
        let ctx = context();
        let input = HookInput::parse(
            json!({
                "hook_event_name": "PostToolUse",
                "tool_name": "Bash",
                "tool_input": {"command": "curl -i https://example.com/private"},
                "tool_response": {"stdout": "HTTP/1.1 401 Unauthorized\n", "stderr": ""}
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();
        assert_eq!(dispatch(&ctx, &input), Decision::NoOpinion);

        let events = ctx.store().unwrap().recent_events(5).unwrap();
        assert_eq!(events[0].action, "auth_failed");
        assert_eq!(events[0].command.as_deref(), Some("https://example.com/private"));
        let detail: serde_json::Value =
            serde_json::from_str(events[0].detail.as_deref().unwrap()).unwrap();
        assert_eq!(detail["response_code"], 401);
        assert_eq!(detail["phase"], "post");
    }

    // ========================================================================
    // Other tools
    // ========================================================================

    #[test]
    fn tmp_writes_are_blocked() {
        let ctx = context();
        let input = HookInput::parse(
            br#"{"tool_name":"Write","tool_input":{"file_path":"/tmp/notes.md","content":""}}"#,
        )
        .unwrap();
        assert_eq!(dispatch(&ctx, &input).rule(), Some(TMP_PATH_WRITE));

        let ok = HookInput::parse(
            br#"{"tool_name":"Write","tool_input":{"file_path":"/repo/hack/tmp/notes.md"}}"#,
        )
        .unwrap();
        assert_eq!(dispatch(&ctx, &ok), Decision::NoOpinion);
    }

    #[test]
    fn plan_mode_is_redirected() {
        let input = HookInput::parse(br#"{"tool_name":"EnterPlanMode","tool_input":{}}"#).unwrap();
        assert_eq!(dispatch(&context(), &input).rule(), Some(PLAN_MODE));
    }

    #[test]
    fn unknown_tools_have_no_opinion() {
        let input = HookInput::parse(br#"{"tool_name":"Read","tool_input":{"file_path":"/tmp/x"}}"#)
            .unwrap();
        assert_eq!(dispatch(&context(), &input), Decision::NoOpinion);
    }

    #[test]
    fn pass_through_is_audited_only_at_level_all() {
        let ctx = context();
        dispatch(&ctx, &bash("make test"));
        assert!(actions(&ctx).is_empty());

        let mut config = GuardConfig::default();
        config.audit_level = AuditLevel::All;
        let ctx = context_with(config, None);
        dispatch(&ctx, &bash("make test"));
        assert_eq!(actions(&ctx), vec![("guard".into(), "allowed".into())]);
    }

    #[test]
    fn cluster_delete_asks() {
        let decision = run("oc delete namespace prod");
        assert!(decision.is_ask());
        assert_eq!(decision.rule(), Some("cluster-critical"));
    }

    #[test]
    fn session_is_remembered() {
        let mut input = bash("make test");
        input.session_id = Some("abc".into());
        let mut ctx = context();
        ctx.bind_event(&input);
        dispatch(&ctx, &input);
        assert_eq!(
            ctx.store().unwrap().last_session_id().unwrap().as_deref(),
            Some("abc")
        );
    }
}
