//! Tolerant extraction of tool-call intents from model text.
//!
//! Models wrap calls in `<tool_call>{json}</tool_call>` blocks, but the
//! surrounding prose is free-form and the blocks themselves are sometimes
//! mangled. A malformed block never aborts parsing; it is reported so the
//! router can fold it back to the model as a validation failure.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

static TOOL_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Non-greedy across newlines; unclosed trailing blocks are ignored.
    Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").unwrap()
});

static JSON_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

/// A call intent lifted from text, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// What extraction produced: usable intents plus per-block failure notes.
#[derive(Debug, Default)]
pub struct Extraction {
    pub calls: Vec<RawCall>,
    pub malformed: Vec<String>,
}

/// Extract tool-call intents from assistant text.
///
/// `<tool_call>` blocks are authoritative. If none exist, fenced JSON
/// objects that carry a `name` field are accepted as a fallback, since some
/// models emit calls that way.
pub fn extract_calls(text: &str) -> Extraction {
    let mut out = Extraction::default();

    for captures in TOOL_CALL_RE.captures_iter(text) {
        let body = &captures[1];
        match serde_json::from_str::<RawCall>(body) {
            Ok(call) => out.calls.push(call),
            Err(e) => out
                .malformed
                .push(format!("unparseable tool_call block: {e}")),
        }
    }

    if !out.calls.is_empty() || !out.malformed.is_empty() {
        return out;
    }

    for captures in JSON_FENCE_RE.captures_iter(text) {
        if let Ok(call) = serde_json::from_str::<RawCall>(&captures[1]) {
            out.calls.push(call);
        }
        // Fenced JSON that is not a call shape is ordinary content.
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_block() {
        let text = r#"Let me run that.
<tool_call>{"name": "run_code", "arguments": {"code": "x = 1"}}</tool_call>"#;

        let out = extract_calls(text);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].name, "run_code");
        assert_eq!(out.calls[0].arguments["code"], "x = 1");
        assert!(out.malformed.is_empty());
    }

    #[test]
    fn test_multiple_blocks_with_prose() {
        let text = r#"First:
<tool_call>{"name": "echo", "arguments": {"message": "a"}}</tool_call>
and then:
<tool_call>{"name": "echo", "arguments": {"message": "b"}}</tool_call>
done."#;

        let out = extract_calls(text);
        assert_eq!(out.calls.len(), 2);
        assert_eq!(out.calls[1].arguments["message"], "b");
    }

    #[test]
    fn test_malformed_block_is_reported_not_fatal() {
        let text = r#"<tool_call>{"name": "echo", }</tool_call>
<tool_call>{"name": "time", "arguments": {}}</tool_call>"#;

        let out = extract_calls(text);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].name, "time");
        assert_eq!(out.malformed.len(), 1);
    }

    #[test]
    fn test_fenced_json_fallback() {
        let text = "Running:\n```json\n{\"name\": \"run_code\", \"arguments\": {\"code\": \"1\"}}\n```";

        let out = extract_calls(text);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].name, "run_code");
    }

    #[test]
    fn test_fenced_json_without_name_ignored() {
        let text = "Here is data:\n```json\n{\"rows\": [1, 2, 3]}\n```";

        let out = extract_calls(text);
        assert!(out.calls.is_empty());
        assert!(out.malformed.is_empty());
    }

    #[test]
    fn test_plain_prose_yields_nothing() {
        let out = extract_calls("The answer is 42.");
        assert!(out.calls.is_empty());
        assert!(out.malformed.is_empty());
    }

    #[test]
    fn test_unclosed_block_ignored() {
        let out = extract_calls(r#"<tool_call>{"name": "echo""#);
        assert!(out.calls.is_empty());
    }

    #[test]
    fn test_missing_arguments_defaults_to_null() {
        let out = extract_calls(r#"<tool_call>{"name": "time"}</tool_call>"#);
        assert_eq!(out.calls.len(), 1);
        assert!(out.calls[0].arguments.is_null());
    }
}
