use serde_json::{json, Value};

/// How much of an undecodable raw output is preserved for audit.
const RAW_CAPTURE_LEN: usize = 512;

/// Outcome of the resilient parse. `data` is always populated: either
/// the decoded object, or a fallback carrying `parse_error` and the
/// truncated raw text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedOutput {
    pub data: Value,
    pub parse_error: bool,
}

/// Coerce free-form model output into a JSON object without ever
/// failing. Tried in order: the full text, the first fenced code block,
/// the outermost brace pair. Anything else degrades to the flagged
/// fallback.
pub fn resilient_parse(raw: &str) -> ParsedOutput {
    if let Some(data) = decode_object(raw) {
        return ParsedOutput { data, parse_error: false };
    }

    if let Some(block) = fenced_block(raw) {
        if let Some(data) = decode_object(block) {
            return ParsedOutput { data, parse_error: false };
        }
    }

    if let Some(slice) = outer_braces(raw) {
        if let Some(data) = decode_object(slice) {
            return ParsedOutput { data, parse_error: false };
        }
    }

    ParsedOutput {
        data: json!({
            "parse_error": true,
            "raw_output": truncate(raw, RAW_CAPTURE_LEN),
        }),
        parse_error: true,
    }
}

fn decode_object(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Contents of the first ``` fence, tolerating a language tag after the
/// opening backticks.
fn fenced_block(raw: &str) -> Option<&str> {
    let open = raw.find("```")?;
    let after_fence = &raw[open + 3..];
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

fn outer_braces(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn truncate(raw: &str, limit: usize) -> String {
    raw.chars().take(limit).collect()
}
