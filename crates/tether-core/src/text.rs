//! Terminal text helpers for human-facing tails.
//!
//! The replay ring stores raw octets; these helpers turn a snapshot into
//! readable lines for callers that want text rather than a byte stream.

use regex::Regex;
use std::sync::OnceLock;

fn ansi_escape_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("static regex"))
}

/// Remove CSI escape sequences from `s`. Other control bytes pass through.
pub fn strip_ansi(s: &str) -> String {
    ansi_escape_re().replace_all(s, "").into_owned()
}

/// The last `n` non-blank lines of `s`, in order.
pub fn last_lines(s: &str, n: usize) -> Vec<String> {
    let non_empty: Vec<&str> = s.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = non_empty.len().saturating_sub(n);
    non_empty[start..].iter().map(|l| l.to_string()).collect()
}
