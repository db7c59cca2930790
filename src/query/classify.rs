//! Statement classification and row-cap wrapping.

use std::sync::OnceLock;

use regex::Regex;

fn select_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)^\s*select\b").unwrap())
}

fn with_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)^\s*with\b").unwrap())
}

fn mutating_keyword() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(insert|update|delete|create|alter|drop|truncate|grant|revoke)\b").unwrap()
    })
}

/// Whether a statement gets the row-capped SELECT treatment.
///
/// Heuristic only: a `WITH` whose body mentions any mutating keyword is
/// treated as a write, even if the word only appears inside a literal.
pub fn is_select_like(sql: &str) -> bool {
    if select_prefix().is_match(sql) {
        return true;
    }

    with_prefix().is_match(sql) && !mutating_keyword().is_match(sql)
}

/// Wrap a select-like statement so at most `max_rows` come back.
///
/// Trailing semicolons and comments are dropped and the statement sits on
/// its own line, so a line comment cannot swallow the closing parenthesis.
pub fn ensure_limit(sql: &str, max_rows: usize) -> String {
    let mut inner = sql.trim();
    loop {
        inner = &inner[..significant_end(inner)];
        match inner.strip_suffix(';') {
            Some(rest) => inner = rest,
            None => break,
        }
    }
    format!("SELECT * FROM (\n{}\n) AS bounded LIMIT {}", inner, max_rows)
}

/// Byte offset just past the last character that is not whitespace or
/// part of a comment. Quoted literals and identifiers are skipped whole.
fn significant_end(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut end = 0;
    let mut i = 0;

    while i < len {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < len && bytes[i] != quote {
                    i += 1;
                }
                i = (i + 1).min(len);
                end = i;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < len && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < len && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i = (i + 2).min(len);
            }
            b if b.is_ascii_whitespace() => i += 1,
            _ => {
                i += 1;
                end = i;
            }
        }
    }

    end
}
