//! Tolerant parsing of model output.
//!
//! Models wrap JSON in markdown fences, prepend chatter, or append notes.
//! [`parse_json_payload`] recovers the outermost JSON document;
//! [`extract_results`] finds the per-item array inside it.

use serde_json::Value;

/// Keys under which a model may nest the per-item array.
const RESULT_KEYS: [&str; 5] = ["results", "items", "events", "analyses", "data"];

/// Why a response could not be turned into per-item results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure(pub String);

impl std::fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip a markdown code fence if the text contains one.
///
/// Returns the body of the first fenced block. An unterminated fence yields
/// everything after the opening line.
pub fn strip_code_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text.trim();
    };
    let after_open = &text[open + 3..];
    // Skip the language tag, if any.
    let body = match after_open.find('\n') {
        Some(nl) => &after_open[nl + 1..],
        None => after_open,
    };
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Parse the outermost JSON object or array in `text`.
pub fn parse_json_payload(text: &str) -> Result<Value, ParseFailure> {
    let body = strip_code_fences(text);
    if body.is_empty() {
        return Err(ParseFailure("empty response".to_string()));
    }
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return Ok(value);
    }

    // Try the span opened by whichever bracket comes first; if stray chatter
    // like "[1]" opened it, the other bracket kind gets a turn.
    let mut spans: Vec<(usize, char)> = [('{', '}'), ('[', ']')]
        .into_iter()
        .filter_map(|(open, close)| body.find(open).map(|start| (start, close)))
        .collect();
    spans.sort_unstable_by_key(|&(start, _)| start);

    let mut first_failure = None;
    for (start, close) in spans {
        let failure = match body.rfind(close).filter(|&end| end > start) {
            Some(end) => match serde_json::from_str(&body[start..=end]) {
                Ok(value) => return Ok(value),
                Err(e) => ParseFailure(format!("invalid JSON: {e}")),
            },
            None => ParseFailure(format!("unterminated JSON starting at byte {start}")),
        };
        first_failure.get_or_insert(failure);
    }
    Err(first_failure
        .unwrap_or_else(|| ParseFailure("no JSON object or array in response".to_string())))
}

/// Pull the per-item entries out of a parsed response.
///
/// Accepts a bare array, an object holding the array under a well-known key,
/// or a single object carrying an `id` (a one-item batch).
pub fn extract_results(value: Value) -> Result<Vec<Value>, ParseFailure> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for key in RESULT_KEYS {
                if let Some(Value::Array(_)) = map.get(key) {
                    if let Some(Value::Array(items)) = map.remove(key) {
                        return Ok(items);
                    }
                }
            }
            if map.contains_key("id") {
                return Ok(vec![Value::Object(map)]);
            }
            Err(ParseFailure(
                "response object has no results array".to_string(),
            ))
        }
        other => Err(ParseFailure(format!(
            "expected a JSON object or array, got {}",
            type_name(&other)
        ))),
    }
}

/// Parse a full response into per-item entries.
pub fn parse_response(text: &str) -> Result<Vec<Value>, ParseFailure> {
    extract_results(parse_json_payload(text)?)
}

/// An entry's item id. Numeric ids are accepted and stringified.
pub fn entry_id(entry: &Value) -> Option<String> {
    match entry.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
