//! Text canonicalization for duplicate detection and JSONB-safe sanitization.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

/// Matches one trailing footer line: a subtext line (`-# ...`) or the `---`
/// separator the response formatter appends.
static FOOTER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:-# .*|---)$").expect("footer pattern compiles"));

/// Strip the trailing footer block from a generated response.
///
/// Stripping happens before any similarity comparison so two responses
/// differing only in their footers still compare equal.
#[must_use]
pub fn strip_response_footer(content: &str) -> String {
    let mut lines: Vec<&str> = content.lines().collect();

    while let Some(last) = lines.last() {
        let trimmed = last.trim();
        if trimmed.is_empty() || FOOTER_LINE.is_match(trimmed) {
            lines.pop();
        } else {
            break;
        }
    }

    lines.join("\n").trim_end().to_string()
}

/// Canonical form used by the word/bigram similarity layers: NFKC,
/// lowercased, whitespace collapsed.
#[must_use]
pub fn normalize_for_similarity(content: &str) -> String {
    let normalized: String = content.nfkc().collect::<String>().to_lowercase();
    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove characters Postgres rejects in JSONB text: NUL bytes and the
/// replacement characters left behind by unpaired surrogate decoding.
#[must_use]
pub fn sanitize_text(content: &str) -> String {
    content
        .chars()
        .filter(|c| *c != '\u{0}' && *c != '\u{fffd}')
        .collect()
}

/// Recursively sanitize every string in a JSON value so the document is
/// safe for JSONB storage.
#[must_use]
pub fn sanitize_json(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_text(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_json).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (sanitize_text(&k), sanitize_json(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Truncate to a character budget, appending an ellipsis marker when cut.
#[must_use]
pub fn truncate_chars(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let truncated: String = content.chars().take(max_chars).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn footer_lines_are_stripped() {
        let content = "Here is the answer.\n\n-# model: test | 120ms";
        assert_eq!(strip_response_footer(content), "Here is the answer.");
    }

    #[test]
    fn separator_and_trailing_blanks_are_stripped() {
        let content = "Body text\n---\n\n";
        assert_eq!(strip_response_footer(content), "Body text");
    }

    #[test]
    fn body_without_footer_is_unchanged() {
        let content = "Line one\nLine two";
        assert_eq!(strip_response_footer(content), content);
    }

    #[test]
    fn normalization_collapses_case_and_whitespace() {
        assert_eq!(
            normalize_for_similarity("Hello   WORLD\n  again"),
            "hello world again"
        );
    }

    #[test]
    fn sanitize_removes_nul_and_replacement_chars() {
        assert_eq!(sanitize_text("a\u{0}b\u{fffd}c"), "abc");
    }

    #[test]
    fn sanitize_json_walks_nested_values() {
        let dirty = json!({"outer": {"inner": "x\u{0}y"}, "list": ["\u{fffd}ok"]});
        let clean = sanitize_json(dirty);
        assert_eq!(clean, json!({"outer": {"inner": "xy"}, "list": ["ok"]}));
    }

    #[test]
    fn truncate_respects_char_budget() {
        assert_eq!(truncate_chars("abcdef", 3), "abc…");
        assert_eq!(truncate_chars("abc", 3), "abc");
    }
}
