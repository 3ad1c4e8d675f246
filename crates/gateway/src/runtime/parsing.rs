//! Pure functions for parsing tool-call directives and structured output
//! out of raw LLM response text (§4.4 step 3 and step 4).
//!
//! Grounded on the original tool's `parse_tool_calls_from_response` /
//! `extract_structured_output`: the accepted shapes, the key list that
//! excludes a bare object from being misread as a tool call, and the
//! "most complete JSON wins" scan are all carried over, just folded into
//! one parser instead of a parser-plus-shared-utility pair.

use serde_json::Value;

use sa_domain::message::ToolCall;

const STRUCTURED_OUTPUT_KEYS: &[&str] = &["project_data", "work_rhythm_data", "onboarding_task"];

/// A tool call parsed out of response text, before dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub tool_name: String,
    pub parameters: serde_json::Map<String, Value>,
}

fn as_parameters(obj: &serde_json::Map<String, Value>) -> serde_json::Map<String, Value> {
    match obj.get("parameters").or_else(|| obj.get("args")) {
        Some(Value::Object(m)) => m.clone(),
        _ => serde_json::Map::new(),
    }
}

/// Shape (a)/(b): does this object look like a tool call? `allow_bare`
/// controls whether a top-level `{"tool_name": ...}` (shape b) is
/// accepted, since inside an array (shape c) the exclusion check the
/// original applies only at the top level is not re-applied per item.
fn tool_call_from_object(obj: &serde_json::Map<String, Value>, check_exclusions: bool) -> Option<ParsedToolCall> {
    if let Some(Value::Object(inner)) = obj.get("tool_call") {
        if let Some(Value::String(name)) = inner.get("tool_name") {
            return Some(ParsedToolCall {
                tool_name: name.clone(),
                parameters: as_parameters(inner),
            });
        }
        return None;
    }
    if let Some(Value::String(name)) = obj.get("tool_name") {
        if check_exclusions && looks_like_structured_output(obj) {
            return None;
        }
        return Some(ParsedToolCall {
            tool_name: name.clone(),
            parameters: as_parameters(obj),
        });
    }
    None
}

fn looks_like_structured_output(obj: &serde_json::Map<String, Value>) -> bool {
    obj.contains_key("STRUCTURED_OUTPUT") || STRUCTURED_OUTPUT_KEYS.iter().any(|k| obj.contains_key(*k))
}

fn parse_tool_calls_from_value(value: &Value) -> Vec<ParsedToolCall> {
    match value {
        Value::Object(obj) => tool_call_from_object(obj, true).into_iter().collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_object())
            .filter_map(|obj| tool_call_from_object(obj, false))
            .collect(),
        _ => Vec::new(),
    }
}

/// Find all markdown ```json``` (or bare ```) fenced blocks and return
/// their inner text, in document order.
fn markdown_json_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after_fence = &rest[start + 3..];
        let body_start = after_fence.strip_prefix("json").unwrap_or(after_fence);
        let body_start = body_start.strip_prefix('\n').unwrap_or(body_start);
        if let Some(end) = body_start.find("```") {
            blocks.push(body_start[..end].trim());
            rest = &body_start[end + 3..];
        } else {
            break;
        }
    }
    blocks
}

/// Parse tool-call directives out of an assistant response. Tries, in
/// order: the whole response as one JSON value (object or array), then
/// each markdown-fenced JSON block. Returns the first shape that yields
/// at least one call.
pub fn parse_tool_calls_from_response(assistant_message: &str) -> Vec<ParsedToolCall> {
    if let Ok(value) = serde_json::from_str::<Value>(assistant_message.trim()) {
        let calls = parse_tool_calls_from_value(&value);
        if !calls.is_empty() {
            return calls;
        }
    }

    for block in markdown_json_blocks(assistant_message) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            let calls = parse_tool_calls_from_value(&value);
            if !calls.is_empty() {
                return calls;
            }
        }
    }

    Vec::new()
}

/// Extract structured output from the final assistant response (§4.4
/// step 4): a literal `STRUCTURED_OUTPUT:` prefix followed by a JSON
/// object, or, failing that, the last embedded JSON object (scanning
/// back to front) whose top-level keys look domain-appropriate.
pub fn extract_structured_output(assistant_message: &str) -> Option<Value> {
    if let Some(idx) = assistant_message.find("STRUCTURED_OUTPUT:") {
        let after = assistant_message[idx + "STRUCTURED_OUTPUT:".len()..].trim_start();
        if let Some(obj) = first_balanced_object(after) {
            if let Ok(value) = serde_json::from_str::<Value>(obj) {
                return Some(value);
            }
        }
    }

    for candidate in balanced_objects(assistant_message).iter().rev() {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
            if STRUCTURED_OUTPUT_KEYS.iter().any(|k| map.contains_key(*k)) {
                return Some(Value::Object(map));
            }
        }
    }

    None
}

/// The first `{...}` substring with balanced braces, starting at the
/// first `{` in `text`. Mirrors `STRUCTURED_OUTPUT:\s*(\{.*\})` applied
/// greedily but constrained to brace balance rather than "longest match".
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// All non-overlapping, non-nested-at-top-level `{...}` substrings in
/// `text`, in document order. A balanced scan standing in for the
/// original's `\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}` regex, which matches a
/// top-level object plus exactly one level of nesting.
fn balanced_objects(text: &str) -> Vec<&str> {
    let mut result = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            let mut depth = 0i32;
            let mut end = None;
            for (j, &b) in bytes.iter().enumerate().skip(i) {
                match b {
                    b'{' => depth += 1,
                    b'}' => {
                        depth -= 1;
                        if depth == 0 {
                            end = Some(j);
                            break;
                        }
                    }
                    _ => {}
                }
            }
            match end {
                Some(j) => {
                    result.push(&text[i..=j]);
                    i = j + 1;
                }
                None => break,
            }
        } else {
            i += 1;
        }
    }
    result
}

/// Convert a parsed call into the domain `ToolCall` wire shape once a
/// call_id has been assigned by the caller.
pub fn into_tool_call(parsed: ParsedToolCall, call_id: impl Into<String>) -> ToolCall {
    ToolCall {
        call_id: call_id.into(),
        tool_name: parsed.tool_name,
        arguments: Value::Object(parsed.parameters),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wrapped_tool_call_shape() {
        let text = r#"{"tool_call": {"tool_name": "search", "parameters": {"q": "rust"}}}"#;
        let calls = parse_tool_calls_from_response(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "search");
        assert_eq!(calls[0].parameters.get("q"), Some(&json!("rust")));
    }

    #[test]
    fn parses_bare_tool_call_shape() {
        let text = r#"{"tool_name": "search", "args": {"q": "rust"}}"#;
        let calls = parse_tool_calls_from_response(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "search");
    }

    #[test]
    fn bare_shape_excludes_structured_output_lookalike() {
        let text = r#"{"tool_name": "search", "project_data": {}}"#;
        assert!(parse_tool_calls_from_response(text).is_empty());
    }

    #[test]
    fn parses_array_of_tool_calls() {
        let text = r#"[{"tool_name": "a", "parameters": {}}, {"tool_call": {"tool_name": "b", "parameters": {}}}]"#;
        let calls = parse_tool_calls_from_response(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tool_name, "a");
        assert_eq!(calls[1].tool_name, "b");
    }

    #[test]
    fn array_items_are_not_exclusion_checked() {
        let text = r#"[{"tool_name": "a", "project_data": {}}]"#;
        let calls = parse_tool_calls_from_response(text);
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn parses_markdown_fenced_tool_call() {
        let text = "Sure, calling it now:\n```json\n{\"tool_call\": {\"tool_name\": \"run\", \"parameters\": {}}}\n```\nDone.";
        let calls = parse_tool_calls_from_response(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "run");
    }

    #[test]
    fn no_tool_call_returns_empty() {
        let text = "Just a plain assistant reply with no JSON at all.";
        assert!(parse_tool_calls_from_response(text).is_empty());
    }

    #[test]
    fn prose_with_unrelated_json_does_not_parse_as_tool_call() {
        let text = r#"Here is some info: {"project_data": {"a": 1}}"#;
        assert!(parse_tool_calls_from_response(text).is_empty());
    }

    #[test]
    fn extracts_structured_output_prefix() {
        let text = "All done.\nSTRUCTURED_OUTPUT: {\"project_data\": {\"name\": \"x\"}}";
        let out = extract_structured_output(text).unwrap();
        assert_eq!(out["project_data"]["name"], json!("x"));
    }

    #[test]
    fn extracts_structured_output_prefix_with_trailing_prose() {
        let text = "STRUCTURED_OUTPUT: {\"onboarding_task\": {\"id\": 1}}\nThanks!";
        let out = extract_structured_output(text).unwrap();
        assert_eq!(out["onboarding_task"]["id"], json!(1));
    }

    #[test]
    fn extracts_embedded_json_object_without_prefix() {
        let text = "Some commentary then {\"not_it\": true} and finally {\"work_rhythm_data\": {\"ok\": true}}";
        let out = extract_structured_output(text).unwrap();
        assert_eq!(out["work_rhythm_data"]["ok"], json!(true));
    }

    #[test]
    fn returns_none_when_no_structured_output_present() {
        let text = "Just chatting, nothing structured here.";
        assert!(extract_structured_output(text).is_none());
    }

    #[test]
    fn structured_output_prefers_last_matching_embedded_object() {
        let text = r#"{"onboarding_task": {"id": 1}} then later {"onboarding_task": {"id": 2}}"#;
        let out = extract_structured_output(text).unwrap();
        assert_eq!(out["onboarding_task"]["id"], json!(2));
    }
}
