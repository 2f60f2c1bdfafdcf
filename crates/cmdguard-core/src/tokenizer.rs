//! Quote-aware shell command tokenizer.
//!
//! Only precise enough to find command boundaries and command names for rule
//! matching. Anything it cannot decompose is still checked as one unit by the
//! caller, so imprecision degrades classification, never safety.
//!
//! ```text
//! "A=1 cmd1 'x && y' && do cmd2 | cmd3 $(cmd4)"
//!        │ split_chain
//!        ▼
//! ["A=1 cmd1 'x && y'", "do cmd2 | cmd3 $(cmd4)"]
//!        │ split_pipe / extract_subshell_bodies
//!        ▼
//! ["do cmd2", "cmd3 $(cmd4)"]   ["cmd4"]
//!        │ strip_control_keyword / strip_env_prefix
//!        ▼
//! "cmd2"                         "cmd1 'x && y'"
//! ```

use std::sync::LazyLock;

use regex::Regex;

static ENV_ASSIGNMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[A-Za-z_]\w*=\S*\s+").unwrap());

static CONTROL_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:do|then|else|elif|if|while|until)\s+").unwrap());

static BACKTICK_BODY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]+)`").unwrap());

static SHELL_DASH_C_QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)^\s*(?:bash|sh)\s+-c\s+(?:'(.*?)'|"(.*?)")\s*$"#).unwrap()
});

static SHELL_DASH_C_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:bash|sh)\s+-c\s+(\S+)").unwrap());

// ============================================================================
// Delimiter strategies
// ============================================================================

/// Which unquoted operators separate parts of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiters {
    /// `&&`, `||`, `;` and newline.
    Chain,
    /// `|` and `|&` (a `||` never reaches this stage).
    Pipe,
}

impl Delimiters {
    /// Width of the delimiter starting at `i`, if any.
    fn width_at(self, bytes: &[u8], i: usize) -> Option<usize> {
        let next = bytes.get(i + 1).copied();
        match (self, bytes[i]) {
            (Self::Chain, b'&') if next == Some(b'&') => Some(2),
            (Self::Chain, b'|') if next == Some(b'|') => Some(2),
            (Self::Chain, b';' | b'\n') => Some(1),
            (Self::Pipe, b'|') if next == Some(b'&') => Some(2),
            (Self::Pipe, b'|') => Some(1),
            _ => None,
        }
    }
}

/// Split `text` on unquoted delimiters recognized by `delimiters`.
///
/// Single and double quotes suppress splitting; a backslash escapes the next
/// character outside single quotes, and backslash-newline is a line
/// continuation that becomes a single space. Parts are trimmed and empty
/// parts dropped.
pub fn split_respecting_quotes(text: &str, delimiters: Delimiters) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if b == b'\\' && !in_single {
            match bytes.get(i + 1) {
                Some(b'\n') => {
                    current.push(' ');
                    i += 2;
                    continue;
                }
                Some(_) => {
                    current.push('\\');
                    i += 1;
                    // The escaped character is copied verbatim below without
                    // being considered as a quote or delimiter.
                    if let Some(ch) = text[i..].chars().next() {
                        current.push(ch);
                        i += ch.len_utf8();
                    }
                    continue;
                }
                None => {}
            }
        }

        if b == b'\'' && !in_double {
            in_single = !in_single;
        } else if b == b'"' && !in_single {
            in_double = !in_double;
        } else if !in_single && !in_double {
            if let Some(width) = delimiters.width_at(bytes, i) {
                push_part(&mut parts, &current);
                current.clear();
                i += width;
                continue;
            }
        }

        match text[i..].chars().next() {
            Some(ch) => {
                current.push(ch);
                i += ch.len_utf8();
            }
            None => break,
        }
    }

    push_part(&mut parts, &current);
    parts
}

fn push_part(parts: &mut Vec<String>, part: &str) {
    let trimmed = part.trim();
    if !trimmed.is_empty() {
        parts.push(trimmed.to_string());
    }
}

// ============================================================================
// Public splitting API
// ============================================================================

/// Split a command into chained sub-commands (`&&`, `||`, `;`, newline).
pub fn split_chain(command: &str) -> Vec<String> {
    split_respecting_quotes(command, Delimiters::Chain)
}

/// Split a sub-command into pipe segments (`|`, `|&`).
pub fn split_pipe(command: &str) -> Vec<String> {
    split_respecting_quotes(command, Delimiters::Pipe)
}

/// Inner commands of every `$(...)` (depth-matched) and backtick pair.
///
/// Nested substitutions are reported at every level, outermost first. An
/// unterminated `$(` contributes nothing.
pub fn extract_subshell_bodies(command: &str) -> Vec<String> {
    let bytes = command.as_bytes();
    let mut bodies = Vec::new();

    let mut start = 0;
    while let Some(offset) = command[start..].find("$(") {
        let open = start + offset + 2;
        let mut depth = 1usize;
        let mut i = open;
        while i < bytes.len() && depth > 0 {
            match bytes[i] {
                b'(' => depth += 1,
                b')' => depth -= 1,
                _ => {}
            }
            i += 1;
        }
        if depth == 0 {
            let body = command[open..i - 1].trim();
            if !body.is_empty() {
                bodies.push(body.to_string());
            }
        }
        start = open;
    }

    for caps in BACKTICK_BODY.captures_iter(command) {
        let body = caps[1].trim();
        if !body.is_empty() {
            bodies.push(body.to_string());
        }
    }

    bodies
}

/// The inner command of a `bash -c '...'` / `sh -c "..."` / `sh -c word` form.
///
/// The quoted form takes everything up to the last matching quote, so an
/// embedded quote of the same kind can truncate the result. Callers still
/// check the outer command, which keeps that imprecision safe.
pub fn unwrap_shell_dash_c(command: &str) -> Option<String> {
    if let Some(caps) = SHELL_DASH_C_QUOTED.captures(command) {
        let inner = caps.get(1).or_else(|| caps.get(2))?;
        return Some(inner.as_str().to_string());
    }
    SHELL_DASH_C_BARE
        .captures(command)
        .map(|caps| caps[1].to_string())
}

/// Remove leading `KEY=value` assignments.
pub fn strip_env_prefix(command: &str) -> &str {
    strip_repeated(command, &ENV_ASSIGNMENT)
}

/// Remove leading shell control keywords (`do`, `then`, `if`, ...).
pub fn strip_control_keyword(command: &str) -> &str {
    strip_repeated(command, &CONTROL_KEYWORD)
}

fn strip_repeated<'a>(command: &'a str, prefix: &Regex) -> &'a str {
    let mut rest = command;
    while let Some(m) = prefix.find(rest) {
        if m.end() == 0 {
            break;
        }
        rest = &rest[m.end()..];
    }
    rest
}

/// Keyword- and env-stripped command, as presented to command-name checks.
pub fn normalize(command: &str) -> &str {
    strip_env_prefix(strip_control_keyword(command))
}
