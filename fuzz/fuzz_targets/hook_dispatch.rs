#![no_main]

use cmdguard_core::config::GuardConfig;
use cmdguard_core::decision::Decision;
use cmdguard_core::event::HookInput;
use cmdguard_core::git_safety::FixedBranch;
use cmdguard_core::rules::RuleSet;
use cmdguard_core::store::GuardStore;
use cmdguard_core::tokenizer::{extract_subshell_bodies, split_chain, split_pipe};
use cmdguard_core::{GuardContext, dispatch};
use libfuzzer_sys::fuzz_target;

fn context() -> Option<GuardContext> {
    let store = GuardStore::open_in_memory().ok()?;
    Some(
        GuardContext::new(GuardConfig::default(), RuleSet::builtin())
            .with_store(store)
            .with_branch_probe(FixedBranch(Some("main".into()))),
    )
}

fuzz_target!(|data: &[u8]| {
    // Raw bytes as a whole event: must never panic, whatever the shape.
    if let (Some(input), Some(ctx)) = (HookInput::parse(data), context()) {
        let _ = dispatch(&ctx, &input);
    }

    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    for unit in split_chain(text) {
        assert!(!unit.is_empty());
        for segment in split_pipe(&unit) {
            assert_eq!(segment.trim(), segment);
        }
        let _ = extract_subshell_bodies(&unit);
    }

    // Same text as a shell command. The decision must be renderable.
    let event = serde_json::json!({"tool_name": "Bash", "tool_input": {"command": text}});
    if let (Some(input), Some(ctx)) = (HookInput::parse(event.to_string().as_bytes()), context()) {
        let decision = dispatch(&ctx, &input);
        if let Decision::Ask { .. } | Decision::Allow { .. } = decision {
            assert!(decision.stdout_payload().is_some());
        }
    }
});
