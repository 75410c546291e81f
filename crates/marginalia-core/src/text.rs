//! Text helpers: HTML stripping, case-insensitive matching, snippets, and
//! FTS5 query construction.
//!
//! All offsets returned by this module are byte offsets into the string
//! they refer to and always fall on `char` boundaries.

use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

const ELLIPSIS: &str = "...";

/// Strip tags, decode entities, and collapse whitespace.
pub fn html_to_plain_text(html: &str) -> String {
    let stripped = TAG_RE.replace_all(html, " ");
    let decoded = html_escape::decode_html_entities(&stripped);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The longest prefix of `s` holding at most `max_chars` characters.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// First case-insensitive occurrence of `needle` in `haystack`.
///
/// Comparison is done on the lowercase expansion of each `char`, so the
/// returned range may differ in byte length from `needle`.
pub fn find_case_insensitive(haystack: &str, needle: &str) -> Option<Range<usize>> {
    let needle: Vec<char> = needle.chars().flat_map(char::to_lowercase).collect();
    if needle.is_empty() {
        return None;
    }

    'starts: for (start, _) in haystack.char_indices() {
        let mut matched = 0;
        for (offset, c) in haystack[start..].char_indices() {
            for lc in c.to_lowercase() {
                if matched < needle.len() {
                    if lc != needle[matched] {
                        continue 'starts;
                    }
                    matched += 1;
                }
            }
            if matched == needle.len() {
                return Some(start..start + offset + c.len_utf8());
            }
        }
        // Ran out of text; shorter suffixes cannot match either.
        return None;
    }
    None
}

/// Every non-overlapping case-insensitive occurrence of `needle`.
pub fn find_all_case_insensitive(haystack: &str, needle: &str) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut from = 0;
    while from < haystack.len() {
        match find_case_insensitive(&haystack[from..], needle) {
            Some(r) => {
                out.push(from + r.start..from + r.end);
                from += r.end.max(r.start + 1);
                while !haystack.is_char_boundary(from) {
                    from += 1;
                }
            }
            None => break,
        }
    }
    out
}

/// A bounded excerpt around a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snippet {
    pub text: String,
    /// Byte ranges of every occurrence of the query inside `text`.
    pub matches: Vec<(usize, usize)>,
}

/// Cut a window of `radius` characters either side of the first match of
/// `query`, widened to the nearest whitespace, with `...` marking each
/// truncated side. Returns `None` when the query does not occur.
pub fn extract_snippet(text: &str, query: &str, radius: usize) -> Option<Snippet> {
    let query = query.trim();
    let hit = find_case_insensitive(text, query)?;

    let hit_start_char = text[..hit.start].chars().count();
    let hit_end_char = hit_start_char + text[hit.clone()].chars().count();

    let mut from = byte_offset(text, hit_start_char.saturating_sub(radius));
    let mut to = byte_offset(text, hit_end_char + radius);

    if from > 0 {
        if let Some((idx, ws)) = text[..from]
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())
        {
            from = idx + ws.len_utf8();
        }
    }
    if to < text.len() {
        if let Some(idx) = text[to..].find(char::is_whitespace) {
            to += idx;
        }
    }

    let prefix = if from > 0 { ELLIPSIS } else { "" };
    let suffix = if to < text.len() { ELLIPSIS } else { "" };
    let body = &text[from..to];

    let matches = find_all_case_insensitive(body, query)
        .into_iter()
        .map(|r| (r.start + prefix.len(), r.end + prefix.len()))
        .collect();

    Some(Snippet {
        text: format!("{prefix}{body}{suffix}"),
        matches,
    })
}

/// The first `max_chars` characters, with `...` when anything was cut.
pub fn leading_excerpt(text: &str, max_chars: usize) -> String {
    let head = truncate_chars(text, max_chars);
    if head.len() < text.len() {
        format!("{head}{ELLIPSIS}")
    } else {
        head.to_string()
    }
}

/// Turn free text into an FTS5 match expression: each whitespace-separated
/// term becomes a quoted string, and terms are implicitly AND-ed.
///
/// Returns `None` if nothing searchable remains.
pub fn fts_match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

fn byte_offset(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_to_plain_text() {
        assert_eq!(
            html_to_plain_text("<p>Hello&nbsp;<b>world</b></p>\n<p>again &amp; again</p>"),
            "Hello world again & again"
        );
        assert_eq!(html_to_plain_text(""), "");
    }

    #[test]
    fn test_find_case_insensitive() {
        let text = "Alpha Beta GAMMA delta";
        let r = find_case_insensitive(text, "gamma").unwrap();
        assert_eq!(&text[r], "GAMMA");
        assert!(find_case_insensitive(text, "epsilon").is_none());
        assert!(find_case_insensitive(text, "").is_none());
    }

    #[test]
    fn test_find_handles_multibyte() {
        let text = "Über café ÉCLAIR";
        let r = find_case_insensitive(text, "éclair").unwrap();
        assert_eq!(&text[r], "ÉCLAIR");
    }

    #[test]
    fn test_snippet_short_text_has_no_ellipsis() {
        let s = extract_snippet("gamma delta", "gamma", 50).unwrap();
        assert_eq!(s.text, "gamma delta");
        assert_eq!(s.matches, vec![(0, 5)]);
    }

    #[test]
    fn test_snippet_snaps_to_whitespace() {
        let text = format!("{} needle {}", "word ".repeat(30), "tail ".repeat(30));
        let s = extract_snippet(&text, "NEEDLE", 12).unwrap();
        assert!(s.text.starts_with("..."));
        assert!(s.text.ends_with("..."));
        // No partial words at either edge.
        let inner = s.text.trim_start_matches("...").trim_end_matches("...");
        assert!(inner.split_whitespace().all(|w| w == "word" || w == "tail" || w == "needle"));
        let (a, b) = s.matches[0];
        assert_eq!(&s.text[a..b], "needle");
    }

    #[test]
    fn test_snippet_missing_query() {
        assert!(extract_snippet("nothing here", "absent", 50).is_none());
    }

    #[test]
    fn test_leading_excerpt() {
        assert_eq!(leading_excerpt("abc", 5), "abc");
        assert_eq!(leading_excerpt("abcdef", 3), "abc...");
    }

    #[test]
    fn test_fts_match_expression_quotes_terms() {
        assert_eq!(
            fts_match_expression("foo \"bar\" baz-qux").as_deref(),
            Some("\"foo\" \"bar\" \"baz-qux\"")
        );
        assert_eq!(fts_match_expression("   \"\" "), None);
    }
}
