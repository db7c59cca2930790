//! Read-only statement validator.
//!
//! The gateway only consults this when read-only enforcement is switched on.

use std::sync::OnceLock;

use regex::Regex;

fn forbidden() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(grant|revoke|copy|refresh|call|do)\b").unwrap())
}

fn read_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)^(select|with)\s").unwrap())
}

/// Accept a single `SELECT` or `WITH` statement and nothing else.
///
/// Any semicolon fails, including a trailing one.
pub fn is_safe_select(sql: &str) -> bool {
    let sql = sql.trim();

    if sql.contains(';') {
        return false;
    }

    if forbidden().is_match(sql) {
        return false;
    }

    read_prefix().is_match(sql)
}
