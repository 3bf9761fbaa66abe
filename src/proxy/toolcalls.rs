use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::proxy::chat::{ContentBlock, ToolSpec};

pub const TOOL_MARKER: &str = "[Calling tool:";
const INPUT_MARKER: &str = "Input:";

pub fn generate_tool_id() -> String {
    format!("toolu_{}", &uuid::Uuid::new_v4().simple().to_string()[..24])
}

#[derive(Debug, Clone)]
pub struct ParsedToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub parse_error: Option<String>,
    pub raw_text: String,
}

impl ParsedToolCall {
    pub fn into_block(self) -> ContentBlock {
        ContentBlock::ToolUse {
            id: self.id,
            name: self.name,
            input: self.input,
        }
    }
}

#[derive(Debug, Default)]
pub struct ExtractResult {
    pub prefix_text: String,
    pub calls: Vec<ParsedToolCall>,
    pub suffix_text: String,
}

/// Emits the legacy inline representation of a tool invocation.
pub fn render_inline(name: &str, input: &Value) -> String {
    let json = serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string());
    format!("{} {}]\n{} {}", TOOL_MARKER, name, INPUT_MARKER, json)
}

/// Converts `tool_use` blocks into the structured wire representation.
pub fn render_structured(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => Some(json!({
                "id": id,
                "type": "function",
                "function": {
                    "name": name,
                    "arguments": serde_json::to_string(input)
                        .unwrap_or_else(|_| "{}".to_string()),
                }
            })),
            _ => None,
        })
        .collect()
}

/// Scans model-emitted text for inline `[Calling tool: ...]` units.
///
/// Returns the text before the first marker, every parseable call, and the
/// non-call text that remains. A candidate that survives neither sanitation
/// pass stays in the output text so nothing the model said is lost.
pub fn extract_blocks(text: &str) -> ExtractResult {
    let mut result = ExtractResult::default();
    let mut rest = text;
    let mut leading = true;

    while let Some(marker_pos) = rest.find(TOOL_MARKER) {
        let before = &rest[..marker_pos];
        if leading {
            result.prefix_text.push_str(before);
        } else {
            result.suffix_text.push_str(before);
        }

        let after_marker = &rest[marker_pos + TOOL_MARKER.len()..];
        let Some(bracket_end) = after_marker.find(']') else {
            // marker never closed, keep it as literal text
            if leading {
                result.prefix_text.push_str(&rest[marker_pos..]);
            } else {
                result.suffix_text.push_str(&rest[marker_pos..]);
            }
            return result;
        };
        let name = after_marker[..bracket_end].trim().to_string();
        let after_name = &after_marker[bracket_end + 1..];

        let Some(input_rel) = after_name.find(INPUT_MARKER) else {
            warn!("[W-TOOLCALL-NO-INPUT] inline_tool_call_missing_input_line: {}", name);
            result.calls.push(ParsedToolCall {
                id: generate_tool_id(),
                name,
                input: json!({}),
                parse_error: Some("missing Input line".to_string()),
                raw_text: rest[marker_pos..marker_pos + TOOL_MARKER.len() + bracket_end + 1]
                    .to_string(),
            });
            rest = after_name;
            leading = false;
            continue;
        };
        let json_region = &after_name[input_rel + INPUT_MARKER.len()..];
        let trimmed = json_region.trim_start();
        let skipped = json_region.len() - trimmed.len();

        if !trimmed.starts_with('{') {
            warn!("[W-TOOLCALL-NO-JSON] inline_tool_call_input_not_object: {}", name);
            result.calls.push(ParsedToolCall {
                id: generate_tool_id(),
                name,
                input: json!({}),
                parse_error: Some("Input not followed by an object".to_string()),
                raw_text: String::new(),
            });
            rest = trimmed;
            leading = false;
            continue;
        }

        let (candidate, consumed) = match find_json_end(trimmed) {
            Some(end) => (&trimmed[..end], end),
            // unterminated JSON runs to the next marker or end of text
            None => match trimmed[1..].find(TOOL_MARKER) {
                Some(next) => (trimmed[..next + 1].trim_end(), next + 1),
                None => (trimmed.trim_end(), trimmed.len()),
            },
        };

        match parse_tolerant(candidate) {
            Ok(input) => {
                result.calls.push(ParsedToolCall {
                    id: generate_tool_id(),
                    name,
                    input,
                    parse_error: None,
                    raw_text: candidate.to_string(),
                });
            }
            Err(e) => {
                warn!(
                    "[W-TOOLCALL-PARSE-FAILED] emitting_candidate_as_text ({}): {}",
                    name, e
                );
                let rendered = format!("{} {}]\n{} {}", TOOL_MARKER, name, INPUT_MARKER, candidate);
                if leading {
                    result.prefix_text.push_str(&rendered);
                } else {
                    result.suffix_text.push_str(&rendered);
                }
            }
        }

        rest = &json_region[skipped + consumed..];
        leading = false;
    }

    if leading {
        result.prefix_text.push_str(rest);
    } else {
        result.suffix_text.push_str(rest);
    }
    result
}

/// Two-pass parse: light sanitation first, strict repair on retry.
fn parse_tolerant(candidate: &str) -> Result<Value, String> {
    let sanitized = strip_trailing_commas(&escape_control_chars_in_strings(candidate));
    match serde_json::from_str::<Value>(&sanitized) {
        Ok(v) => Ok(v),
        Err(first_err) => {
            let repaired = close_unclosed(&sanitized);
            match serde_json::from_str::<Value>(&repaired) {
                Ok(v) => {
                    debug!("Tool-call JSON required repair pass: {}", first_err);
                    Ok(v)
                }
                Err(second_err) => Err(format!("{}; after repair: {}", first_err, second_err)),
            }
        }
    }
}

/// Offset one past the balanced closing brace of the object starting at 0.
pub fn find_json_end(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &b) in bytes.iter().enumerate() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match b {
            b'\\' => escape_next = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Escapes raw control bytes (0x00-0x1F) that appear inside string literals.
pub fn escape_control_chars_in_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escape_next = false;

    for c in text.chars() {
        if escape_next {
            out.push(c);
            escape_next = false;
            continue;
        }
        match c {
            '\\' => {
                out.push(c);
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            '\n' if in_string => out.push_str("\\n"),
            '\r' if in_string => out.push_str("\\r"),
            '\t' if in_string => out.push_str("\\t"),
            c if in_string && (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Removes `,` immediately before `}` or `]` outside of strings.
pub fn strip_trailing_commas(text: &str) -> String {
    let mut out: Vec<char> = Vec::with_capacity(text.len());
    let mut in_string = false;
    let mut escape_next = false;

    for c in text.chars() {
        if escape_next {
            out.push(c);
            escape_next = false;
            continue;
        }
        match c {
            '\\' => {
                out.push(c);
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            '}' | ']' if !in_string => {
                while matches!(out.last(), Some(last) if last.is_whitespace()) {
                    out.pop();
                }
                if out.last() == Some(&',') {
                    out.pop();
                }
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.into_iter().collect()
}

/// Strict repair pass: balance quotes and brackets so a best-effort parse can
/// still succeed on truncated output.
fn close_unclosed(text: &str) -> String {
    let mut result = text.trim_end().to_string();

    let mut quote_open = false;
    let mut escape_next = false;
    let mut stack: Vec<char> = Vec::new();
    for c in result.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' => escape_next = true,
            '"' => quote_open = !quote_open,
            '{' if !quote_open => stack.push('}'),
            '[' if !quote_open => stack.push(']'),
            '}' | ']' if !quote_open => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    if quote_open {
        result.push('"');
    }
    while let Some(closer) = stack.pop() {
        result.push(closer);
    }
    result
}

pub fn has_tool_call_marker(text: &str) -> bool {
    text.contains(TOOL_MARKER)
}

/// True when the text ends in a tool call whose JSON has not closed yet.
/// Drives both stream buffering and truncation detection.
pub fn has_incomplete_tool_call(text: &str) -> bool {
    let Some(marker_pos) = text.rfind(TOOL_MARKER) else {
        return false;
    };
    let after = &text[marker_pos..];
    if !after.contains(']') {
        return true;
    }
    let Some(input_pos) = after.find(INPUT_MARKER) else {
        // header complete, input not started yet
        return true;
    };
    let json_part = after[input_pos + INPUT_MARKER.len()..].trim_start();
    if json_part.is_empty() {
        return true;
    }
    if !json_part.starts_with('{') {
        return false;
    }
    find_json_end(json_part).is_none()
}

/// Clamps tool and parameter descriptions before they go on the wire.
pub fn clamp_tool_specs(tools: &mut [ToolSpec], desc_max: usize, param_desc_max: usize) {
    for tool in tools.iter_mut() {
        if tool.description.len() > desc_max {
            tool.description.truncate(floor_char_boundary(&tool.description, desc_max));
            debug!("Clamped description of tool `{}` to {} chars", tool.name, desc_max);
        }
        if let Some(props) = tool
            .input_schema
            .get_mut("properties")
            .and_then(Value::as_object_mut)
        {
            for (_, prop) in props.iter_mut() {
                if let Some(desc) = prop.get_mut("description") {
                    if let Some(s) = desc.as_str() {
                        if s.len() > param_desc_max {
                            let clamped = s[..floor_char_boundary(s, param_desc_max)].to_string();
                            *desc = Value::String(clamped);
                        }
                    }
                }
            }
        }
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_call() {
        let text = "Let me read that.\n[Calling tool: Read]\nInput: {\"path\": \"/tmp/x\"}\nDone.";
        let result = extract_blocks(text);
        assert_eq!(result.prefix_text.trim(), "Let me read that.");
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].name, "Read");
        assert_eq!(result.calls[0].input["path"], "/tmp/x");
        assert_eq!(result.suffix_text.trim(), "Done.");
    }

    #[test]
    fn extracts_multiple_calls() {
        let text = "[Calling tool: Read]\nInput: {\"path\": \"a\"}\n[Calling tool: Grep]\nInput: {\"pattern\": \"fn main\"}";
        let result = extract_blocks(text);
        assert_eq!(result.calls.len(), 2);
        assert_eq!(result.calls[1].name, "Grep");
        assert_eq!(result.calls[1].input["pattern"], "fn main");
    }

    #[test]
    fn tolerates_raw_newline_in_string() {
        let text = "[Calling tool: Write]\nInput: {\"content\": \"line one\nline two\"}";
        let result = extract_blocks(text);
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].input["content"], "line one\nline two");
    }

    #[test]
    fn tolerates_trailing_comma() {
        let text = "[Calling tool: Run]\nInput: {\"cmd\": \"ls\", }";
        let result = extract_blocks(text);
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].input["cmd"], "ls");
    }

    #[test]
    fn repairs_truncated_json() {
        let text = "[Calling tool: Write]\nInput: {\"path\": \"/tmp/y\", \"content\": \"abc";
        let result = extract_blocks(text);
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].input["path"], "/tmp/y");
    }

    #[test]
    fn nested_braces_in_strings_do_not_confuse_scanner() {
        let text = r#"[Calling tool: Edit]
Input: {"old": "fn a() { }", "new": "fn a() { return 1; }"}"#;
        let result = extract_blocks(text);
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].input["new"], "fn a() { return 1; }");
    }

    #[test]
    fn unparseable_candidate_stays_as_text() {
        let text = "[Calling tool: Bad]\nInput: {\"a\": not json at all::}";
        let result = extract_blocks(text);
        assert!(result.calls.is_empty());
        assert!(result.prefix_text.contains("[Calling tool: Bad]"));
    }

    #[test]
    fn incomplete_detection() {
        assert!(has_incomplete_tool_call("[Calling tool: Read]\nInput: {\"pa"));
        assert!(has_incomplete_tool_call("text then [Calling tool: Re"));
        assert!(!has_incomplete_tool_call(
            "[Calling tool: Read]\nInput: {\"path\": \"x\"}"
        ));
        assert!(!has_incomplete_tool_call("plain text"));
    }

    #[test]
    fn render_inline_round_trips() {
        let input = serde_json::json!({"path": "/tmp/x"});
        let rendered = render_inline("Read", &input);
        let result = extract_blocks(&rendered);
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].input, input);
    }

    #[test]
    fn render_structured_skips_non_tool_blocks() {
        let blocks = vec![
            ContentBlock::Text {
                text: "hi".to_string(),
            },
            ContentBlock::ToolUse {
                id: "t1".to_string(),
                name: "Read".to_string(),
                input: serde_json::json!({"path": "x"}),
            },
        ];
        let calls = render_structured(&blocks);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["function"]["name"], "Read");
    }

    #[test]
    fn clamps_descriptions() {
        let mut tools = vec![ToolSpec {
            name: "Read".to_string(),
            description: "x".repeat(100),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "y".repeat(100)}
                }
            }),
        }];
        clamp_tool_specs(&mut tools, 10, 5);
        assert_eq!(tools[0].description.len(), 10);
        assert_eq!(
            tools[0].input_schema["properties"]["path"]["description"]
                .as_str()
                .unwrap()
                .len(),
            5
        );
    }
}
