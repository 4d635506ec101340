//! Pull program text out of a model response.

use std::sync::OnceLock;

use regex::Regex;

const PYTHON_TAGS: &[&str] = &["python", "py", "python3"];

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```([\w+-]*)[ \t]*\r?\n(.*?)```").expect("fence pattern compiles")
    })
}

/// Return the code carried by `response`.
///
/// Prefers the first fenced block tagged as Python, then the first fenced
/// block of any tag. A response without fences is taken as code verbatim.
pub fn extract_code(response: &str) -> String {
    let mut first_any: Option<&str> = None;
    for caps in fence_regex().captures_iter(response) {
        let tag = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        if PYTHON_TAGS.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            return normalize(body);
        }
        first_any.get_or_insert(body);
    }
    match first_any {
        Some(body) => normalize(body),
        None => normalize(response),
    }
}

fn normalize(code: &str) -> String {
    let mut out = code.trim_matches('\n').trim_end().to_string();
    out.push('\n');
    out
}
