use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    String(String),
    Array(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::String(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: MessageContent::String(text.into()),
        }
    }

    pub fn blocks(&self) -> Option<&[ContentBlock]> {
        match &self.content {
            MessageContent::Array(blocks) => Some(blocks),
            MessageContent::String(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.content {
            MessageContent::String(s) => s.trim().is_empty(),
            MessageContent::Array(blocks) => blocks.is_empty(),
        }
    }

    /// Concatenated plain text of the message, tool blocks excluded.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::String(s) => s.clone(),
            MessageContent::Array(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Character weight of the message as the history budget sees it.
    pub fn char_count(&self) -> usize {
        match &self.content {
            MessageContent::String(s) => s.len(),
            MessageContent::Array(_) => serde_json::to_string(&self.content)
                .map(|s| s.len())
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SystemPrompt {
    String(String),
    Array(Vec<SystemBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemBlock {
    #[serde(rename = "type", default = "text_type")]
    pub block_type: String,
    pub text: String,
}

fn text_type() -> String {
    "text".to_string()
}

impl SystemPrompt {
    pub fn as_text(&self) -> String {
        match self {
            SystemPrompt::String(s) => s.clone(),
            SystemPrompt::Array(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
}

/// Dialect-free request shape every inbound call is reduced to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub thinking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
    Error,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::ToolUse => "tool_use",
            StopReason::StopSequence => "stop_sequence",
            StopReason::Error => "error",
        }
    }

    pub fn from_openai_finish(reason: &str) -> Self {
        match reason {
            "stop" => StopReason::EndTurn,
            "length" => StopReason::MaxTokens,
            "tool_calls" => StopReason::ToolUse,
            "content_filter" => StopReason::Error,
            _ => StopReason::EndTurn,
        }
    }

    pub fn to_openai_finish(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "stop",
            StopReason::MaxTokens => "length",
            StopReason::ToolUse => "tool_calls",
            StopReason::StopSequence => "stop",
            StopReason::Error => "stop",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

/// One step of an upstream answer after dialect decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    Start { model: String },
    TextDelta(String),
    ThinkingDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { arguments: String },
    Finish { stop_reason: StopReason, usage: Option<Usage> },
    Error(String),
}

// ==================== token estimation ====================

/// CJK-aware estimate. ASCII text runs at `chars_per_token`, wide characters
/// at roughly 1.5 chars per token.
pub fn estimate_tokens(text: &str, chars_per_token: f64) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let mut ascii = 0u32;
    let mut wide = 0u32;
    for c in text.chars() {
        if c.is_ascii() {
            ascii += 1;
        } else {
            wide += 1;
        }
    }
    let ascii_tokens = (ascii as f64 / chars_per_token).ceil() as u32;
    let wide_tokens = (wide as f64 / 1.5).ceil() as u32;
    ascii_tokens + wide_tokens
}

pub fn estimate_request_tokens(request: &ChatRequest, chars_per_token: f64) -> u32 {
    let mut total = 0u32;
    if let Some(system) = &request.system {
        total += estimate_tokens(&system.as_text(), chars_per_token);
    }
    for msg in &request.messages {
        total += 4;
        match &msg.content {
            MessageContent::String(s) => total += estimate_tokens(s, chars_per_token),
            MessageContent::Array(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            total += estimate_tokens(text, chars_per_token)
                        }
                        ContentBlock::Thinking { thinking } => {
                            total += estimate_tokens(thinking, chars_per_token)
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            total += 20;
                            total += estimate_tokens(name, chars_per_token);
                            if let Ok(json) = serde_json::to_string(input) {
                                total += estimate_tokens(&json, chars_per_token);
                            }
                        }
                        ContentBlock::ToolResult { content, .. } => {
                            total += 10;
                            if let Some(s) = content.as_str() {
                                total += estimate_tokens(s, chars_per_token);
                            } else if let Ok(json) = serde_json::to_string(content) {
                                total += estimate_tokens(&json, chars_per_token);
                            }
                        }
                    }
                }
            }
        }
    }
    for tool in &request.tools {
        if let Ok(json) = serde_json::to_string(tool) {
            total += estimate_tokens(&json, chars_per_token);
        }
    }
    total
}

// ==================== normalization pipeline ====================

fn append_block(content: &mut MessageContent, incoming: MessageContent) {
    let existing = std::mem::replace(content, MessageContent::String(String::new()));
    let mut blocks = match existing {
        MessageContent::Array(blocks) => blocks,
        MessageContent::String(s) => {
            if s.is_empty() {
                Vec::new()
            } else {
                vec![ContentBlock::Text { text: s }]
            }
        }
    };
    match incoming {
        MessageContent::Array(more) => blocks.extend(more),
        MessageContent::String(s) => {
            if !s.is_empty() {
                blocks.push(ContentBlock::Text { text: s });
            }
        }
    }
    *content = MessageContent::Array(blocks);
}

/// Collapses runs of same-role messages into one block-list message.
pub fn merge_consecutive_messages(messages: &mut Vec<Message>) {
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    for msg in messages.drain(..) {
        match merged.last_mut() {
            Some(prev) if prev.role == msg.role => {
                append_block(&mut prev.content, msg.content);
            }
            _ => merged.push(msg),
        }
    }
    *messages = merged;
}

/// Invariant T1: each assistant `tool_use` id must be answered by a
/// `tool_result` with the same id in the immediately following user message.
/// Unmatched blocks on either side are dropped rather than papered over with
/// synthetic results.
pub fn enforce_tool_pairing(messages: &mut [Message]) {
    use std::collections::HashSet;

    let len = messages.len();
    for i in 0..len {
        if messages[i].role != "assistant" {
            continue;
        }
        let use_ids: HashSet<String> = messages[i]
            .blocks()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let answered: HashSet<String> = if i + 1 < len && messages[i + 1].role == "user" {
            messages[i + 1]
                .blocks()
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::ToolResult { tool_use_id, .. } => {
                                Some(tool_use_id.clone())
                            }
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default()
        } else {
            HashSet::new()
        };

        if !use_ids.is_empty() {
            let orphans: Vec<&String> = use_ids.difference(&answered).collect();
            if !orphans.is_empty() {
                tracing::debug!(
                    "Dropping {} unanswered tool_use block(s) at message {}",
                    orphans.len(),
                    i
                );
            }
            if let MessageContent::Array(blocks) = &mut messages[i].content {
                blocks.retain(|b| match b {
                    ContentBlock::ToolUse { id, .. } => answered.contains(id),
                    _ => true,
                });
            }
        }

        if i + 1 < len && messages[i + 1].role == "user" {
            if let MessageContent::Array(blocks) = &mut messages[i + 1].content {
                blocks.retain(|b| match b {
                    ContentBlock::ToolResult { tool_use_id, .. } => use_ids.contains(tool_use_id),
                    _ => true,
                });
            }
        }
    }

    // tool_result blocks not preceded by any assistant turn
    if let Some(first) = messages.first_mut() {
        if first.role == "user" {
            if let MessageContent::Array(blocks) = &mut first.content {
                blocks.retain(|b| !matches!(b, ContentBlock::ToolResult { .. }));
            }
        }
    }
}

pub fn drop_empty_messages(messages: &mut Vec<Message>) {
    messages.retain(|m| !m.is_empty());
}

/// Full normalization pass over an already dialect-decoded request.
/// Leaves roles strictly alternating user/assistant with a trailing user
/// message, or reports a validation error.
pub fn normalize_request(request: &mut ChatRequest, merge: bool) -> AppResult<()> {
    if request.messages.is_empty() {
        return Err(AppError::Validation("messages must not be empty".to_string()));
    }

    // system turns are extracted before this point by the dialect mappers;
    // anything left over is folded into the system field
    let mut system_extra: Vec<String> = Vec::new();
    request.messages.retain(|m| {
        if m.role == "system" {
            system_extra.push(m.text());
            false
        } else {
            true
        }
    });
    if !system_extra.is_empty() {
        let mut text = request
            .system
            .as_ref()
            .map(|s| s.as_text())
            .unwrap_or_default();
        for extra in system_extra {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&extra);
        }
        request.system = Some(SystemPrompt::String(text));
    }

    if merge {
        merge_consecutive_messages(&mut request.messages);
    }
    enforce_tool_pairing(&mut request.messages);
    drop_empty_messages(&mut request.messages);
    if merge {
        // dropping blocks can create fresh same-role runs
        merge_consecutive_messages(&mut request.messages);
    }

    // the normalized history starts on a user turn
    if request
        .messages
        .first()
        .map(|m| m.role == "assistant")
        .unwrap_or(false)
    {
        tracing::debug!("Dropping leading assistant message during normalization");
        request.messages.remove(0);
    }

    for pair in request.messages.windows(2) {
        if pair[0].role == pair[1].role {
            return Err(AppError::Invariant(format!(
                "role alternation violated: consecutive `{}` messages",
                pair[0].role
            )));
        }
    }

    match request.messages.last() {
        Some(last) if last.role == "user" => Ok(()),
        Some(last) => Err(AppError::Validation(format!(
            "conversation must end with a user message, found `{}`",
            last.role
        ))),
        None => Err(AppError::Validation(
            "all messages were dropped during normalization".to_string(),
        )),
    }
}

pub fn total_chars(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.char_count()).sum()
}

pub fn count_user_messages(messages: &[Message]) -> usize {
    messages.iter().filter(|m| m.role == "user").count()
}

pub fn count_tool_calls(messages: &[Message]) -> usize {
    messages
        .iter()
        .filter_map(|m| m.blocks())
        .flatten()
        .filter(|b| {
            matches!(
                b,
                ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. }
            )
        })
        .count()
}

pub fn last_user_text(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.text())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_use(id: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: "Read".to_string(),
            input: json!({"path": "/tmp/x"}),
        }
    }

    fn tool_result(id: &str) -> ContentBlock {
        ContentBlock::ToolResult {
            tool_use_id: id.to_string(),
            content: json!("abc"),
            is_error: None,
        }
    }

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: "claude-opus-4-5".to_string(),
            messages,
            system: None,
            tools: vec![],
            max_tokens: Some(1024),
            temperature: None,
            top_p: None,
            stream: false,
            stop_sequences: vec![],
            thinking: false,
            metadata: None,
        }
    }

    #[test]
    fn merge_collapses_same_role_runs() {
        let mut messages = vec![
            Message::user("a"),
            Message::user("b"),
            Message::assistant("c"),
        ];
        merge_consecutive_messages(&mut messages);
        assert_eq!(messages.len(), 2);
        match &messages[0].content {
            MessageContent::Array(blocks) => assert_eq!(blocks.len(), 2),
            other => panic!("expected merged blocks, got {:?}", other),
        }
    }

    #[test]
    fn pairing_keeps_answered_tool_use() {
        let mut messages = vec![
            Message::user("read the file"),
            Message {
                role: "assistant".to_string(),
                content: MessageContent::Array(vec![tool_use("t1")]),
            },
            Message {
                role: "user".to_string(),
                content: MessageContent::Array(vec![tool_result("t1")]),
            },
        ];
        enforce_tool_pairing(&mut messages);
        assert_eq!(messages[1].blocks().unwrap().len(), 1);
        assert_eq!(messages[2].blocks().unwrap().len(), 1);
    }

    #[test]
    fn pairing_drops_orphans_on_both_sides() {
        let mut messages = vec![
            Message {
                role: "assistant".to_string(),
                content: MessageContent::Array(vec![
                    tool_use("t1"),
                    ContentBlock::Text {
                        text: "calling".to_string(),
                    },
                ]),
            },
            Message {
                role: "user".to_string(),
                content: MessageContent::Array(vec![tool_result("t2")]),
            },
        ];
        enforce_tool_pairing(&mut messages);
        assert!(messages[0]
            .blocks()
            .unwrap()
            .iter()
            .all(|b| !matches!(b, ContentBlock::ToolUse { .. })));
        assert!(messages[1].blocks().unwrap().is_empty());
    }

    #[test]
    fn normalize_rejects_trailing_assistant() {
        let mut req = request(vec![Message::user("hi"), Message::assistant("hello")]);
        let err = normalize_request(&mut req, true).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn normalize_extracts_system_messages() {
        let mut req = request(vec![
            Message {
                role: "system".to_string(),
                content: MessageContent::String("be terse".to_string()),
            },
            Message::user("hi"),
        ]);
        normalize_request(&mut req, true).unwrap();
        assert_eq!(req.system.as_ref().unwrap().as_text(), "be terse");
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn normalize_alternates_after_drops() {
        let mut req = request(vec![
            Message::user("one"),
            Message {
                role: "assistant".to_string(),
                content: MessageContent::Array(vec![tool_use("gone")]),
            },
            Message::user("two"),
        ]);
        normalize_request(&mut req, true).unwrap();
        // the orphaned tool_use empties the assistant turn, the two user
        // turns merge back into one
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, "user");
    }

    #[test]
    fn normalize_drops_leading_assistant() {
        let mut req = request(vec![
            Message::assistant("welcome back"),
            Message::user("hi"),
        ]);
        normalize_request(&mut req, true).unwrap();
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, "user");
    }

    #[test]
    fn estimate_counts_wide_chars_densely() {
        let ascii = estimate_tokens("hello world!", 3.0);
        let cjk = estimate_tokens("你好世界你好世界你好世界", 3.0);
        assert_eq!(ascii, 4);
        assert_eq!(cjk, 8);
    }

    #[test]
    fn stop_reason_round_trip() {
        assert_eq!(StopReason::from_openai_finish("length"), StopReason::MaxTokens);
        assert_eq!(StopReason::MaxTokens.to_openai_finish(), "length");
        assert_eq!(StopReason::from_openai_finish("tool_calls"), StopReason::ToolUse);
    }
}
