//! cmdguard-core: policy engine behind the `cmdguard` hook.
//!
//! An agent host hands the hook one tool-invocation event at a time. The
//! engine decides whether the invocation proceeds, needs the user's
//! confirmation, or is refused with guidance toward the preferred tool.
//!
//! # Architecture
//!
//! ```text
//! stdin JSON → HookInput → dispatcher ──► tokenizer (chain / pipe / subshell units)
//!                              │
//!                              ├──► git_safety   (deny → fetch-before-branch → ask)
//!                              ├──► rules        (tool-selection patterns)
//!                              ├──► fetch_guard  (authenticated URL hosts)
//!                              └──► cluster_risk (oc/kubectl, manifest inspection)
//!                              │
//!                              ▼
//!                     Finding → context (trust lookup, audit) → Decision
//! ```
//!
//! # Modules
//!
//! - `dispatcher`: per-event check ordering
//! - `context`: per-invocation state, lazy store, finding→decision mapping
//! - `tokenizer`: quote-aware command splitting
//! - `rules`: rule model and built-in tool-selection table
//! - `rule_file`: side-loaded JSON rule files and validation
//! - `git_safety`: git deny/ask predicates and branch probing
//! - `fetch_guard`: URL extraction, URL rules, auth-failure detection
//! - `cluster_risk`: oc/kubectl risk classification
//! - `manifest`: bounded manifest inspection
//! - `store`: SQLite trust and audit store
//! - `trust`: trust entries and grants
//! - `audit`: audit levels, events, redaction
//! - `decision`: findings and the host-facing decision contract
//! - `event`: hook input parsing
//! - `config`: TOML configuration
//! - `logging`: diagnostic tracing setup
//! - `error`: error types with remediation hints
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod audit;
pub mod cluster_risk;
pub mod config;
pub mod context;
pub mod decision;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod fetch_guard;
pub mod git_safety;
pub mod logging;
pub mod manifest;
pub mod rule_file;
pub mod rules;
pub mod store;
pub mod tokenizer;
pub mod trust;

pub use config::GuardConfig;
pub use context::GuardContext;
pub use decision::{Decision, Finding};
pub use dispatcher::dispatch;
pub use error::{Error, Result};
pub use event::HookInput;

/// Version of the cmdguard-core crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
