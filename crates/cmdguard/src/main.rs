//! cmdguard - pre-execution guard hook for agent tool invocations.
//!
//! Hook mode (the default) reads one event from stdin and answers per the
//! host contract: exit 2 with guidance on stderr to block, a JSON decision on
//! stdout to ask or allow, or silence to pass through. The `trust` and
//! `validate` subcommands manage the side state the hook consults.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use cmdguard_core::audit::AuditLevel;
use cmdguard_core::config::{self, GuardConfig};
use cmdguard_core::decision::{BLOCK_EXIT_CODE, Decision};
use cmdguard_core::event::{HookInput, MAX_INPUT_BYTES};
use cmdguard_core::logging::{LogConfig, LogError, init_logging};
use cmdguard_core::rule_file::{self, RuleKind, ValidationReport};
use cmdguard_core::store::GuardStore;
use cmdguard_core::trust::{TrustGrant, TrustScope};
use cmdguard_core::{GuardContext, dispatch};

/// Guard hook that vets agent shell commands, URL fetches and file writes.
#[derive(Parser, Debug)]
#[command(name = "cmdguard")]
#[command(version, about, long_about = None)]
#[command(after_help = "Run 'cmdguard validate' after editing side-loaded rule files.")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true, env = "CMDGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Trust and audit store location
    #[arg(long, global = true, env = "GUARD_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Audit verbosity: off, actions or all
    #[arg(long, global = true, env = "GUARD_LOG_LEVEL")]
    audit_level: Option<String>,

    /// Full-bypass command prefix (empty disables bypass)
    #[arg(long, global = true)]
    bypass_token: Option<String>,

    /// Side-loaded command rules (JSON array)
    #[arg(long, global = true, env = "COMMAND_GUARD_EXTRA_RULES")]
    command_rules: Option<PathBuf>,

    /// Side-loaded URL rules (JSON array)
    #[arg(long, global = true, env = "URL_GUARD_EXTRA_RULES")]
    url_rules: Option<PathBuf>,

    /// Append diagnostic logs to this file
    #[arg(long, global = true, env = "CMDGUARD_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Subcommand to run (omit to run in hook mode)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decide one hook event read from stdin
    Hook,

    /// Manage pre-approvals for ask-type rules
    Trust {
        #[command(subcommand)]
        action: TrustCommand,
    },

    /// Check side-loaded rule files without running the guard
    Validate,
}

#[derive(Subcommand, Debug)]
enum TrustCommand {
    /// Pre-approve an ask-type rule
    Add {
        /// Rule name, as shown in the ask prompt
        rule: String,

        /// Only trust matches containing this text (case-insensitive)
        #[arg(long = "match")]
        match_pattern: Option<String>,

        /// session or always
        #[arg(long, default_value = "always")]
        scope: TrustScope,

        /// Session to trust (defaults to the last session the guard saw)
        #[arg(long)]
        session_id: Option<String>,
    },

    /// Remove trust entries for a rule
    Remove {
        rule: String,

        /// Only the entry with exactly this match text
        #[arg(long = "match")]
        match_pattern: Option<String>,
    },

    /// Show all trust entries
    List,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Hook) => {
            // A broken config must not block the agent.
            let config = load_config(&cli).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "config unusable; using defaults");
                apply_overrides(GuardConfig::default(), &cli)
            });
            start_logging(&config.log);
            run_hook(config)
        }
        Some(Commands::Trust { ref action }) => report(
            load_config(&cli).and_then(|config| {
                start_logging(&config.log);
                run_trust(&config, action)
            }),
        ),
        Some(Commands::Validate) => match load_config(&cli) {
            Ok(config) => run_validate(&config),
            Err(err) => report(Err(err)),
        },
    }
}

/// Logging is optional: a log file that cannot be opened is reported once and
/// the command carries on.
fn start_logging(log: &LogConfig) {
    if let Some(warning) = logging_warning(init_logging(log)) {
        eprintln!("{warning}");
    }
}

fn logging_warning(result: std::result::Result<(), LogError>) -> Option<String> {
    match result {
        Err(err @ LogError::FileCreate(_)) => Some(format!("cmdguard: warning: {err}")),
        Err(err) => {
            tracing::debug!(error = %err, "logging not initialized");
            None
        }
        Ok(()) => None,
    }
}

// ============================================================================
// Configuration
// ============================================================================

fn load_config(cli: &Cli) -> Result<GuardConfig> {
    let path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let config = GuardConfig::load_from(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    Ok(apply_overrides(config, cli))
}

/// Flags and environment win over the config file.
fn apply_overrides(mut config: GuardConfig, cli: &Cli) -> GuardConfig {
    if let Some(path) = non_empty(cli.db_path.as_deref()) {
        config.db_path = path.to_path_buf();
    }
    if let Some(level) = &cli.audit_level {
        config.audit_level = AuditLevel::parse_lenient(level);
    }
    // Read directly: an empty value is meaningful here (it disables bypass).
    let token = cli
        .bypass_token
        .clone()
        .or_else(|| std::env::var("GUARD_BYPASS_TOKEN").ok());
    if let Some(token) = token {
        config = config.with_bypass_token(&token);
    }
    if let Some(path) = non_empty(cli.command_rules.as_deref()) {
        config.command_rules_path = Some(path.to_path_buf());
    }
    if let Some(path) = non_empty(cli.url_rules.as_deref()) {
        config.url_rules_path = Some(path.to_path_buf());
    }
    if let Some(path) = non_empty(cli.log_file.as_deref()) {
        config.log.file = Some(path.to_path_buf());
    }
    config
}

fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}

// ============================================================================
// Hook mode
// ============================================================================

fn run_hook(config: GuardConfig) -> ExitCode {
    let mut raw = Vec::new();
    let limit = MAX_INPUT_BYTES as u64 + 1;
    if let Err(err) = io::stdin().lock().take(limit).read_to_end(&mut raw) {
        tracing::debug!(error = %err, "failed to read hook input");
        return ExitCode::SUCCESS;
    }
    let Some(input) = HookInput::parse(&raw) else {
        return ExitCode::SUCCESS;
    };

    let mut ctx = GuardContext::from_config(config);
    ctx.bind_event(&input);
    let decision = dispatch(&ctx, &input);
    tracing::debug!(?decision, tool = %input.tool_name, "hook decided");
    emit(&decision)
}

fn emit(decision: &Decision) -> ExitCode {
    if let Some(payload) = decision.stdout_payload() {
        println!("{payload}");
    }
    if let Some(text) = decision.stderr_text() {
        eprintln!("{text}");
    }
    ExitCode::from(u8::try_from(decision.exit_code()).unwrap_or(1))
}

// ============================================================================
// Trust management
// ============================================================================

fn run_trust(config: &GuardConfig, action: &TrustCommand) -> Result<()> {
    let store = GuardStore::open(&config.db_path)
        .map_err(cmdguard_core::Error::from)
        .context("opening guard store")?;

    match action {
        TrustCommand::Add {
            rule,
            match_pattern,
            scope,
            session_id,
        } => {
            let ctx = GuardContext::from_config(config.clone());
            let grant = TrustGrant::new(
                &ctx.rules,
                rule,
                match_pattern.clone().filter(|p| !p.is_empty()),
                *scope,
                session_id.clone().filter(|id| !id.is_empty()),
                || store.last_session_id().ok().flatten(),
            )?;
            let entry = store.add_trust(&grant).map_err(cmdguard_core::Error::from)?;
            println!("Trusted: {}", entry.describe());
        }
        TrustCommand::Remove {
            rule,
            match_pattern,
        } => {
            let removed = store
                .remove_trust(rule, match_pattern.as_deref())
                .map_err(cmdguard_core::Error::from)?;
            println!("Removed {removed} trust rule(s) for '{rule}'.");
        }
        TrustCommand::List => {
            let entries = store.list_trust().map_err(cmdguard_core::Error::from)?;
            if entries.is_empty() {
                println!("No trusted rules configured.");
                return Ok(());
            }
            println!("{:<30} {:<20} {:<10} Created", "Rule", "Pattern", "Scope");
            println!("{}", "-".repeat(80));
            for entry in entries {
                let scope = match &entry.session_id {
                    Some(id) => format!("{}:{}", entry.scope, short_id(id)),
                    None => entry.scope.to_string(),
                };
                println!(
                    "{:<30} {:<20} {:<10} {}",
                    entry.rule_name,
                    entry.match_pattern.as_deref().unwrap_or("(any)"),
                    scope,
                    entry.created_ts
                );
            }
        }
    }
    Ok(())
}

fn short_id(id: &str) -> &str {
    id.char_indices().nth(8).map_or(id, |(end, _)| &id[..end])
}

// ============================================================================
// Validation
// ============================================================================

fn run_validate(config: &GuardConfig) -> ExitCode {
    let reports: Vec<ValidationReport> = [
        (RuleKind::Command, config.command_rules_path.as_deref()),
        (RuleKind::Url, config.url_rules_path.as_deref()),
    ]
    .into_iter()
    .filter_map(|(kind, path)| path.map(|p| rule_file::validate_rules_file(p, kind)))
    .collect();

    if reports.is_empty() {
        println!("No custom guard rules configured.");
        return ExitCode::SUCCESS;
    }

    if reports.iter().all(ValidationReport::is_ok) {
        for report in &reports {
            println!("Custom guard rules: {}", report.summary());
        }
        return ExitCode::SUCCESS;
    }

    eprintln!("Custom guard rules: validation failed:");
    for report in &reports {
        for problem in &report.problems {
            eprintln!("  \u{2717} {problem}");
        }
    }
    for report in reports.iter().filter(|r| r.is_ok()) {
        eprintln!("  \u{2713} {}", report.summary());
    }
    ExitCode::from(exit_byte(BLOCK_EXIT_CODE))
}

// ============================================================================
// Error reporting
// ============================================================================

fn report(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(remediation) = err
                .downcast_ref::<cmdguard_core::Error>()
                .and_then(cmdguard_core::Error::remediation)
            {
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::from(exit_byte(BLOCK_EXIT_CODE))
        }
    }
}

fn exit_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn log_file_failure_is_surfaced() {
        let err = LogError::FileCreate(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        let warning = logging_warning(Err(err)).unwrap();
        assert!(warning.contains("failed to create log file: denied"));

        assert_eq!(logging_warning(Err(LogError::AlreadyInitialized)), None);
        assert_eq!(logging_warning(Ok(())), None);
    }

    #[test]
    fn trust_add_parses_scope_and_match() {
        let cli = Cli::try_parse_from([
            "cmdguard",
            "trust",
            "add",
            "stash-drop",
            "--match",
            "stash@{0}",
            "--scope",
            "session",
            "--session-id",
            "s1",
        ])
        .unwrap();
        let Some(Commands::Trust {
            action:
                TrustCommand::Add {
                    rule,
                    match_pattern,
                    scope,
                    session_id,
                },
        }) = cli.command
        else {
            panic!("expected trust add");
        };
        assert_eq!(rule, "stash-drop");
        assert_eq!(match_pattern.as_deref(), Some("stash@{0}"));
        assert_eq!(scope, TrustScope::Session);
        assert_eq!(session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn invalid_scope_is_rejected() {
        assert!(Cli::try_parse_from(["cmdguard", "trust", "add", "x", "--scope", "forever"]).is_err());
    }

    #[test]
    fn no_subcommand_means_hook_mode() {
        let cli = Cli::try_parse_from(["cmdguard"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn short_id_truncates() {
        assert_eq!(short_id("abcdefghijkl"), "abcdefgh");
        assert_eq!(short_id("abc"), "abc");
    }
}
