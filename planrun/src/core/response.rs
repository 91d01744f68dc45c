//! Lenient extraction of a JSON object from agent output.
//!
//! Agents often wrap their answer in a markdown fence or add a sentence around it.
//! Parsing tries, in order: the whole text, the first fenced block, then the span
//! from the first `{` to the last `}`.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)\r?\n?```").expect("fence regex is valid")
});

/// Parse the first JSON object found in `text` as `T`.
///
/// Returns the last parse error message when no candidate parses.
pub fn parse_json_response<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let mut last_error = "empty response".to_string();
    for candidate in candidates(text) {
        match serde_json::from_str::<T>(candidate) {
            Ok(value) => return Ok(value),
            Err(err) => last_error = err.to_string(),
        }
    }
    Err(last_error)
}

fn candidates(text: &str) -> Vec<&str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let mut out = vec![trimmed];
    if let Some(inner) = FENCE_RE.captures(trimmed).and_then(|caps| caps.get(1)) {
        out.push(inner.as_str().trim());
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            out.push(&trimmed[start..=end]);
        }
    }
    out
}
