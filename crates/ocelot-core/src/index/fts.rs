//! FTS5 query construction.
//!
//! User input is never passed to FTS5 raw: terms with reserved syntax are
//! quoted, and the last token gets a `*` for prefix search.

use regex::Regex;
use std::sync::LazyLock;

/// Characters that trigger quoting to defuse FTS5 operators.
static FTS5_SPECIAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"[^a-z0-9]"#).unwrap());

/// Escape a single term for use inside an FTS5 MATCH expression.
pub fn escape_term(term: &str) -> String {
    if FTS5_SPECIAL.is_match(term) {
        format!("\"{}\"", term.replace('"', "\"\""))
    } else {
        term.to_string()
    }
}

/// Build an FTS5 MATCH expression from free text.
///
/// All tokens are AND-ed (FTS5 implicit AND); the final token is a prefix
/// query. Empty input produces an empty string, which callers treat as
/// "no FTS filter".
pub fn build_match_query(search_term: &str) -> String {
    let search_term = search_term.trim().to_lowercase();
    if search_term.is_empty() {
        return String::new();
    }

    let tokens: Vec<&str> = search_term.split_whitespace().collect();
    let last = tokens.len() - 1;
    tokens
        .iter()
        .enumerate()
        .map(|(i, token)| {
            let escaped = escape_term(token);
            if i == last {
                format!("{}*", escaped)
            } else {
                escaped
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
