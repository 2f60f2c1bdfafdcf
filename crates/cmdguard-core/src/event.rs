//! Host event payloads.
//!
//! One JSON object arrives per invocation. Only the fields read here matter;
//! everything else is ignored so host-side additions never break parsing.
//! Identifier fields are read leniently: a value of the wrong type reads as
//! absent instead of rejecting the whole event.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Inputs larger than this are not analyzed.
pub const MAX_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Raw hook input as delivered by the host.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookInput {
    #[serde(default, deserialize_with = "lenient_string")]
    pub hook_event_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_name")]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_response: Value,
    #[serde(default, deserialize_with = "lenient_string")]
    pub session_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub tool_use_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_path")]
    pub cwd: Option<PathBuf>,
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => Some(text),
        _ => None,
    })
}

fn lenient_name<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    lenient_string(deserializer).map(Option::unwrap_or_default)
}

fn lenient_path<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<PathBuf>, D::Error> {
    lenient_string(deserializer).map(|path| path.map(PathBuf::from))
}

/// When in the tool lifecycle the event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    PreToolUse,
    PostToolUse,
}

/// The tool invocation, classified into the kinds the guard handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    /// Shell command text.
    Shell { command: String },
    /// Direct URL fetch.
    WebFetch { url: String },
    /// A tool that writes a file at `path`.
    FileWrite { tool: String, path: String },
    /// Switch into native planning mode.
    PlanMode,
    /// Anything else; the guard has no opinion on it.
    Other { tool: String },
}

impl HookInput {
    /// Parse raw stdin bytes. Oversized input is rejected as `None`, as is
    /// anything that is not a JSON object.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_INPUT_BYTES {
            tracing::debug!(len = bytes.len(), "hook input over size cap");
            return None;
        }
        match serde_json::from_slice::<Self>(bytes) {
            Ok(input) => Some(input),
            Err(err) => {
                tracing::debug!(error = %err, "hook input is not a valid event");
                None
            }
        }
    }

    pub fn phase(&self) -> HookPhase {
        match self.hook_event_name.as_deref() {
            Some("PostToolUse") => HookPhase::PostToolUse,
            _ => HookPhase::PreToolUse,
        }
    }

    pub fn tool_call(&self) -> ToolCall {
        match self.tool_name.as_str() {
            "Bash" => ToolCall::Shell {
                command: self.input_str("command").unwrap_or_default().to_string(),
            },
            "WebFetch" => ToolCall::WebFetch {
                url: self.input_str("url").unwrap_or_default().to_string(),
            },
            "Write" | "Edit" | "NotebookEdit" => {
                let path = ["file_path", "path", "notebook_path"]
                    .iter()
                    .find_map(|key| self.input_str(key))
                    .unwrap_or_default();
                ToolCall::FileWrite {
                    tool: self.tool_name.clone(),
                    path: path.to_string(),
                }
            }
            "EnterPlanMode" => ToolCall::PlanMode,
            other => ToolCall::Other {
                tool: other.to_string(),
            },
        }
    }

    fn input_str(&self, key: &str) -> Option<&str> {
        self.tool_input.get(key).and_then(Value::as_str)
    }

    /// Text of a tool response: shell stdout and stderr joined, or the whole
    /// response rendered for other tools.
    pub fn response_text(&self) -> String {
        match &self.tool_response {
            Value::Null => String::new(),
            Value::String(text) => text.clone(),
            Value::Object(map) if map.contains_key("stdout") || map.contains_key("stderr") => {
                let part = |key: &str| map.get(key).and_then(Value::as_str).unwrap_or_default();
                format!("{}\n{}", part("stdout"), part("stderr"))
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(json: &str) -> HookInput {
        HookInput::parse(json.as_bytes()).expect("valid input")
    }

    #[test]
    fn classifies_shell_commands() {
        let hi = input(r#"{"tool_name":"Bash","tool_input":{"command":"ls"},"session_id":"s1"}"#);
        assert_eq!(hi.phase(), HookPhase::PreToolUse);
        assert_eq!(
            hi.tool_call(),
            ToolCall::Shell {
                command: "ls".into()
            }
        );
        assert_eq!(hi.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn classifies_file_writes_by_any_path_key() {
        let hi = input(r#"{"tool_name":"NotebookEdit","tool_input":{"notebook_path":"/tmp/n.ipynb"}}"#);
        assert_eq!(
            hi.tool_call(),
            ToolCall::FileWrite {
                tool: "NotebookEdit".into(),
                path: "/tmp/n.ipynb".into()
            }
        );
    }

    #[test]
    fn classifies_plan_mode_and_other_tools() {
        assert_eq!(input(r#"{"tool_name":"EnterPlanMode"}"#).tool_call(), ToolCall::PlanMode);
        assert_eq!(
            input(r#"{"tool_name":"Read","tool_input":{"file_path":"x"}}"#).tool_call(),
            ToolCall::Other { tool: "Read".into() }
        );
    }

    #[test]
    fn post_tool_use_phase() {
        let hi = input(r#"{"hook_event_name":"PostToolUse","tool_name":"WebFetch"}"#);
        assert_eq!(hi.phase(), HookPhase::PostToolUse);
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(HookInput::parse(b"not json").is_none());
        assert!(HookInput::parse(b"[1,2]").is_none());
        assert!(HookInput::parse(b"{}").is_some());
    }

    #[test]
    fn wrong_typed_identifiers_read_as_absent() {
        let hi = input(
            r#"{"hook_event_name":7,"tool_name":"Bash","tool_input":{"command":"git reset --hard"},
                "session_id":42,"tool_use_id":["x"],"cwd":{"dir":"/repo"}}"#,
        );
        assert_eq!(hi.phase(), HookPhase::PreToolUse);
        assert_eq!(hi.session_id, None);
        assert_eq!(hi.tool_use_id, None);
        assert_eq!(hi.cwd, None);
        assert_eq!(
            hi.tool_call(),
            ToolCall::Shell {
                command: "git reset --hard".into()
            }
        );

        let hi = input(r#"{"tool_name":null,"tool_input":{"command":"ls"}}"#);
        assert_eq!(hi.tool_call(), ToolCall::Other { tool: String::new() });
    }

    #[test]
    fn oversized_input_is_rejected() {
        let big = vec![b' '; MAX_INPUT_BYTES + 1];
        assert!(HookInput::parse(&big).is_none());
    }

    #[test]
    fn response_text_joins_shell_streams() {
        let hi = input(
            r#"{"tool_name":"Bash","tool_response":{"stdout":"HTTP/1.1 401","stderr":"denied"}}"#,
        );
        assert_eq!(hi.response_text(), "HTTP/1.1 401\ndenied");
    }
}
