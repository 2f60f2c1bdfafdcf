//! Property-based tests for command splitting and deny-rule coverage.
//!
//! Validates:
//! 1. split_chain: unquoted words joined by chain operators come back as units
//! 2. split_chain: operators inside quotes never split
//! 3. split_chain / split_pipe: every part is trimmed and non-empty
//! 4. strip_env_prefix / strip_control_keyword: idempotent, return a suffix
//! 5. normalize: removes any number of leading assignments
//! 6. dispatch: never panics on arbitrary text
//! 7. dispatch: a git deny rule anywhere in a chain blocks, behind any
//!    control keyword or env prefix

use proptest::prelude::*;

use cmdguard_core::config::GuardConfig;
use cmdguard_core::decision::Decision;
use cmdguard_core::event::HookInput;
use cmdguard_core::git_safety::FixedBranch;
use cmdguard_core::rules::RuleSet;
use cmdguard_core::store::GuardStore;
use cmdguard_core::tokenizer::{
    normalize, split_chain, split_pipe, strip_control_keyword, strip_env_prefix,
};
use cmdguard_core::{GuardContext, dispatch};

// =============================================================================
// Strategies
// =============================================================================

/// A command word with no shell metacharacters.
fn arb_word() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_.-]{0,8}"
}

/// A simple command: one to four words.
fn arb_simple_command() -> impl Strategy<Value = String> {
    prop::collection::vec(arb_word(), 1..5).prop_map(|words| words.join(" "))
}

fn arb_chain_op() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just(" && "), Just(" || "), Just("; "), Just("\n")]
}

fn arb_env_prefix() -> impl Strategy<Value = String> {
    prop::collection::vec("[A-Z][A-Z0-9_]{0,6}=[a-z0-9]{0,4}", 0..3)
        .prop_map(|assigns| assigns.iter().map(|a| format!("{a} ")).collect())
}

fn arb_keyword() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just(""),
        Just("do "),
        Just("then "),
        Just("else "),
        Just("if "),
        Just("while "),
    ]
}

fn arb_deny_command() -> impl Strategy<Value = (&'static str, &'static str)> {
    prop_oneof![
        Just(("git reset --hard HEAD~1", "reset-hard")),
        Just(("git push --force origin feat", "push-force")),
        Just(("git clean -fdx", "clean-ignored")),
        Just(("git add -f build/", "add-force")),
    ]
}

fn guard() -> GuardContext {
    GuardContext::new(GuardConfig::default(), RuleSet::builtin())
        .with_store(GuardStore::open_in_memory().expect("in-memory store"))
        .with_branch_probe(FixedBranch(Some("feat/prop".into())))
}

fn bash(command: &str) -> HookInput {
    let event = serde_json::json!({"tool_name": "Bash", "tool_input": {"command": command}});
    HookInput::parse(event.to_string().as_bytes()).expect("valid event")
}

// =============================================================================
// Splitting
// =============================================================================

proptest! {
    #[test]
    fn chain_units_round_trip(
        first in arb_simple_command(),
        rest in prop::collection::vec((arb_chain_op(), arb_simple_command()), 0..5),
    ) {
        let mut command = first.clone();
        let mut expected = vec![first];
        for (op, unit) in rest {
            command.push_str(op);
            command.push_str(&unit);
            expected.push(unit);
        }
        prop_assert_eq!(split_chain(&command), expected);
    }

    #[test]
    fn quoted_operators_never_split(
        left in arb_simple_command(),
        right in arb_simple_command(),
        op in arb_chain_op(),
        quote in prop_oneof![Just('\''), Just('"')],
    ) {
        let command = format!("echo {quote}{left}{op}{right}{quote}");
        prop_assert_eq!(split_chain(&command), vec![command.trim().to_string()]);
    }

    #[test]
    fn parts_are_trimmed_and_non_empty(text in "[ -~\n]{0,80}") {
        for part in split_chain(&text).iter().chain(split_pipe(&text).iter()) {
            prop_assert!(!part.is_empty());
            prop_assert_eq!(part.trim(), part.as_str());
        }
    }
}

// =============================================================================
// Prefix stripping
// =============================================================================

proptest! {
    #[test]
    fn stripping_is_idempotent_and_returns_suffix(text in "[ -~]{0,60}") {
        let env = strip_env_prefix(&text);
        prop_assert!(text.ends_with(env));
        prop_assert_eq!(strip_env_prefix(env), env);

        let kw = strip_control_keyword(&text);
        prop_assert!(text.ends_with(kw));
        prop_assert_eq!(strip_control_keyword(kw), kw);
    }

    #[test]
    fn normalize_removes_assignments(prefix in arb_env_prefix(), command in arb_simple_command()) {
        prop_assume!(strip_control_keyword(&command) == command);
        let full = format!("{prefix}{command}");
        prop_assert_eq!(normalize(&full), command.as_str());
    }
}

// =============================================================================
// Dispatch
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn dispatch_never_panics(text in "\\PC{0,120}") {
        let ctx = guard();
        let _ = dispatch(&ctx, &bash(&text));
    }

    #[test]
    fn deny_rule_blocks_anywhere_in_chain(
        before in prop::collection::vec(arb_simple_command(), 0..3),
        keyword in arb_keyword(),
        env in arb_env_prefix(),
        (deny, rule) in arb_deny_command(),
    ) {
        // Keep the filler from tripping a rule of its own.
        prop_assume!(before.iter().all(|c| !c.split_whitespace().any(|w| w == "git")));
        let filler: Vec<String> = before.iter().map(|c| format!("make {c}")).collect();
        let mut units = filler;
        units.push(format!("{keyword}{env}{deny}"));
        let command = units.join(" && ");

        let decision = dispatch(&guard(), &bash(&command));
        prop_assert!(
            matches!(&decision, Decision::Block { rule: r, .. } if r == rule),
            "{command:?} -> {decision:?}"
        );
    }
}
