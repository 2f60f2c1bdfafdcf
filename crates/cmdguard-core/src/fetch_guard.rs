//! Fetch/URL guard.
//!
//! Raw fetches of authenticated services return login pages or 401s, and
//! the content an agent actually wants is reachable through a CLI that
//! carries credentials. URLs in `curl`/`wget` commands and direct fetches
//! are matched against a table of authenticated-service patterns.
//!
//! After execution, responses are scanned for authentication-failure
//! signatures for the audit trail only.

use std::sync::LazyLock;

use aho_corasick::AhoCorasick;
use regex::Regex;
use serde::Serialize;

use crate::rules::{self, Action, PatternRule, Rule, RuleMatch};
use crate::tokenizer::strip_env_prefix;

/// In-band marker that lets a fetch through after logging it.
pub const FETCH_BYPASS_TOKEN: &str = "ALLOW_FETCH=1";

static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>]+"#).unwrap());
static FETCH_COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(curl|wget)\b").unwrap());
static BYPASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)ALLOW_FETCH=1(?:\s|$)").unwrap());

const BYPASS_HINT: &str =
    "\nIf you've confirmed raw fetch is appropriate, prefix with `ALLOW_FETCH=1`.";

const BUILTIN_URL_RULES: &[(&str, &str, &str)] = &[
    (
        "github-api",
        r"api\.github\.com",
        "Use `gh api repos/OWNER/REPO/...` instead of fetching the GitHub API directly.",
    ),
    (
        "github-auth-content",
        r"github\.com/[^/]+/[^/]+/(settings|pulls|issues|actions|security)",
        "Use `gh pr view`, `gh issue view` or `gh run view` for authenticated GitHub pages.",
    ),
    (
        "gitlab-api",
        r"gitlab\.com/api/",
        "Use `glab api` instead of fetching the GitLab API directly.",
    ),
    (
        "gitlab-raw",
        r"gitlab\.com/.+/(-/raw/|-/blob/)",
        "Use `glab api projects/:id/repository/files/...` for GitLab file content.",
    ),
    (
        "google-docs",
        r"docs\.google\.com/document/",
        "Google Docs require authentication. Ask the user to export the document.",
    ),
    (
        "google-drive",
        r"drive\.google\.com/(file|drive)/",
        "Google Drive requires authentication. Ask the user to share the file contents.",
    ),
    (
        "google-sheets",
        r"sheets\.google\.com/",
        "Google Sheets require authentication. Ask the user to export as CSV.",
    ),
    (
        "atlassian-api",
        r"[a-z0-9-]+\.atlassian\.net/(rest/api|wiki)/",
        "Atlassian pages require authentication. Use the Jira/Confluence CLI or ask the user.",
    ),
    (
        "jira-server",
        r"jira\.[a-z0-9-]+\.(com|org|net)/",
        "Jira requires authentication. Use the Jira CLI or ask the user for the issue text.",
    ),
    (
        "slack-api",
        r"(api|hooks)\.slack\.com/",
        "Slack endpoints require a token. Use the Slack MCP/CLI integration instead.",
    ),
];

/// Compile the built-in authenticated-service table (all block).
pub fn builtin_url_rules() -> Vec<Rule> {
    BUILTIN_URL_RULES
        .iter()
        .map(|(name, pattern, message)| {
            PatternRule::new(*name, pattern, None, *message, Action::Block)
                .map(Rule::from)
                .unwrap_or_else(|err| panic!("built-in URL rule {name} does not compile: {err}"))
        })
        .collect()
}

/// Every URL-like substring, in order of appearance.
pub fn extract_urls(text: &str) -> Vec<&str> {
    URL.find_iter(text).map(|m| m.as_str()).collect()
}

/// True when the command's program is `curl` or `wget`.
pub fn is_fetch_command(command: &str) -> bool {
    FETCH_COMMAND.is_match(strip_env_prefix(command))
}

pub fn has_bypass_token(command: &str) -> bool {
    BYPASS.is_match(command)
}

/// First authenticated-service rule matching `url`.
pub fn match_url<'a>(url: &str, rules: &'a [Rule]) -> Option<RuleMatch<'a>> {
    rules::evaluate(url, rules, &[])
}

// ============================================================================
// Per-URL verdicts
// ============================================================================

/// What happened to one checked URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlOutcome {
    Allowed,
    Blocked,
    Asked,
    Bypassed,
}

impl UrlOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Blocked => "blocked",
            Self::Asked => "asked",
            Self::Bypassed => "bypassed",
        }
    }

    fn for_action(action: Action) -> Self {
        match action {
            Action::Block => Self::Blocked,
            Action::Ask => Self::Asked,
            Action::Allow => Self::Allowed,
        }
    }
}

/// One URL with the rule it matched (if any) and the resulting outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlVerdict {
    pub url: String,
    pub rule: Option<String>,
    pub outcome: UrlOutcome,
    /// Guidance for the first non-bypassed match.
    pub message: Option<String>,
    pub action: Option<Action>,
}

/// Check URLs in order, stopping at the first enforced match.
///
/// With `bypass`, every URL is reported (matches as `Bypassed`) and nothing
/// is enforced.
pub fn check_urls<'u>(
    urls: impl IntoIterator<Item = &'u str>,
    rules: &[Rule],
    bypass: bool,
) -> Vec<UrlVerdict> {
    let mut verdicts = Vec::new();
    for url in urls {
        match match_url(url, rules) {
            Some(matched) if bypass => verdicts.push(UrlVerdict {
                url: url.to_string(),
                rule: Some(matched.rule.to_string()),
                outcome: UrlOutcome::Bypassed,
                message: None,
                action: None,
            }),
            Some(matched) => {
                verdicts.push(UrlVerdict {
                    url: url.to_string(),
                    rule: Some(matched.rule.to_string()),
                    outcome: UrlOutcome::for_action(matched.action),
                    message: Some(matched.message.to_string()),
                    action: Some(matched.action),
                });
                break;
            }
            None => verdicts.push(UrlVerdict {
                url: url.to_string(),
                rule: None,
                outcome: UrlOutcome::Allowed,
                message: None,
                action: None,
            }),
        }
    }
    verdicts
}

/// URL verdicts for a shell command; empty unless it runs `curl`/`wget`.
///
/// Enforced guidance is extended with how to bypass.
pub fn check_fetch_command(command: &str, rules: &[Rule]) -> Vec<UrlVerdict> {
    if !is_fetch_command(command) {
        return Vec::new();
    }
    let mut verdicts = check_urls(extract_urls(command), rules, has_bypass_token(command));
    for verdict in &mut verdicts {
        if let (Some(message), Some(Action::Block | Action::Ask)) =
            (verdict.message.as_mut(), verdict.action)
        {
            message.push_str(BYPASS_HINT);
        }
    }
    verdicts
}

// ============================================================================
// Post-execution auth-failure scan
// ============================================================================

static STATUS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"HTTP/[\d.]+ (\d{3})\b").unwrap());
static AUTH_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)HTTP/[\d.]+ 40[137]\b|curl: \(22\).*40[1379]|sign.?in|SSO.*redirect").unwrap()
});
static AUTH_PHRASES: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(["unauthorized", "access denied", "login required"])
        .unwrap()
});

/// Result of scanning a fetch response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthProbe {
    pub auth_failed: bool,
    /// First HTTP status line seen, if any.
    pub status: Option<u16>,
}

pub fn detect_auth_failure(response: &str) -> AuthProbe {
    let status = STATUS_LINE
        .captures(response)
        .and_then(|caps| caps[1].parse().ok());
    AuthProbe {
        auth_failed: AUTH_STATUS.is_match(response) || AUTH_PHRASES.is_match(response),
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin() -> Vec<Rule> {
        builtin_url_rules()
    }

    #[test]
    fn extracts_urls_stopping_at_quotes() {
        let urls = extract_urls(r#"curl -H 'x' "https://a.com/p?q=1" http://b.org/x>out"#);
        assert_eq!(urls, vec!["https://a.com/p?q=1", "http://b.org/x"]);
    }

    #[test]
    fn github_api_is_blocked_with_cli_guidance() {
        let verdicts = check_fetch_command("curl https://api.github.com/repos/org/repo", &builtin());
        assert_eq!(verdicts.len(), 1);
        let v = &verdicts[0];
        assert_eq!(v.rule.as_deref(), Some("github-api"));
        assert_eq!(v.outcome, UrlOutcome::Blocked);
        let message = v.message.as_deref().unwrap();
        assert!(message.contains("gh api"));
        assert!(message.contains("ALLOW_FETCH=1"));
    }

    #[test]
    fn direct_url_guidance_has_no_bypass_hint() {
        let verdicts = check_urls(["https://docs.google.com/document/d/1"], &builtin(), false);
        assert_eq!(verdicts[0].rule.as_deref(), Some("google-docs"));
        assert!(!verdicts[0].message.as_deref().unwrap().contains("ALLOW_FETCH"));
    }

    #[test]
    fn bypass_reports_but_does_not_enforce() {
        let verdicts = check_fetch_command(
            "ALLOW_FETCH=1 curl https://api.github.com/x https://example.com",
            &builtin(),
        );
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].outcome, UrlOutcome::Bypassed);
        assert!(verdicts[0].action.is_none());
        assert_eq!(verdicts[1].outcome, UrlOutcome::Allowed);
    }

    #[test]
    fn only_fetch_programs_are_checked() {
        assert!(check_fetch_command("echo https://api.github.com", &builtin()).is_empty());
        assert!(!check_fetch_command("wget https://docs.google.com/document/d/1", &builtin())
            .is_empty());
        assert!(is_fetch_command("HTTPS_PROXY=x curl https://a"));
    }

    #[test]
    fn unmatched_urls_are_allowed_and_reported() {
        let verdicts = check_fetch_command("curl https://example.com/a https://crates.io", &builtin());
        assert_eq!(verdicts.len(), 2);
        assert!(verdicts.iter().all(|v| v.outcome == UrlOutcome::Allowed));
    }

    #[test]
    fn stops_at_first_enforced_match() {
        let verdicts = check_urls(
            [
                "https://example.com",
                "https://hooks.slack.com/services/x",
                "https://api.github.com",
            ],
            &builtin(),
            false,
        );
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[1].rule.as_deref(), Some("slack-api"));
    }

    #[test]
    fn service_table_coverage() {
        let rules = builtin();
        for (url, rule) in [
            ("https://github.com/org/repo/pulls", "github-auth-content"),
            ("https://gitlab.com/api/v4/projects", "gitlab-api"),
            ("https://gitlab.com/g/p/-/raw/main/f", "gitlab-raw"),
            ("https://drive.google.com/file/d/1", "google-drive"),
            ("https://sheets.google.com/x", "google-sheets"),
            ("https://acme.atlassian.net/wiki/spaces", "atlassian-api"),
            ("https://jira.acme.com/browse/X-1", "jira-server"),
        ] {
            assert_eq!(match_url(url, &rules).map(|m| m.rule), Some(rule), "{url}");
        }
        assert!(match_url("https://github.com/org/repo", &rules).is_none());
    }

    #[test]
    fn detects_auth_failures() {
        let probe = detect_auth_failure("HTTP/1.1 401 Unauthorized\r\n");
        assert!(probe.auth_failed);
        assert_eq!(probe.status, Some(401));

        assert!(detect_auth_failure("Please Sign in to continue").auth_failed);
        assert!(detect_auth_failure("ACCESS DENIED").auth_failed);
        assert!(detect_auth_failure("curl: (22) The requested URL returned error: 403").auth_failed);

        let ok = detect_auth_failure("HTTP/2 200 \n{}");
        assert!(!ok.auth_failed);
        assert_eq!(ok.status, Some(200));
    }
}
