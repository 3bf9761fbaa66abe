use serde_json::{json, Value};

use super::models::OpenAIRequest;
use crate::proxy::chat::{
    ChatRequest, ContentBlock, Message, MessageContent, SystemPrompt, ToolSpec,
};
use crate::proxy::toolcalls;

/// Lifts a chat-completions request into the normalized shape.
///
/// Assistant `tool_calls` become `tool_use` blocks; `tool`-role messages
/// become user messages carrying one `tool_result` block each, which the
/// normalization pass then merges and pairs.
pub fn to_normalized(request: OpenAIRequest) -> ChatRequest {
    let mut messages: Vec<Message> = Vec::with_capacity(request.messages.len());
    let mut system_parts: Vec<String> = Vec::new();

    for msg in request.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = msg.content {
                    system_parts.push(content.as_text());
                }
            }
            "assistant" => {
                let mut blocks: Vec<ContentBlock> = Vec::new();
                if let Some(content) = msg.content {
                    let text = content.as_text();
                    if !text.is_empty() {
                        blocks.push(ContentBlock::Text { text });
                    }
                }
                if let Some(calls) = msg.tool_calls {
                    for call in calls {
                        let input = serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| json!({}));
                        blocks.push(ContentBlock::ToolUse {
                            id: call.id,
                            name: call.function.name,
                            input,
                        });
                    }
                }
                messages.push(Message {
                    role: "assistant".to_string(),
                    content: MessageContent::Array(blocks),
                });
            }
            "tool" => {
                let content = msg
                    .content
                    .map(|c| Value::String(c.as_text()))
                    .unwrap_or(Value::String(String::new()));
                messages.push(Message {
                    role: "user".to_string(),
                    content: MessageContent::Array(vec![ContentBlock::ToolResult {
                        tool_use_id: msg.tool_call_id.unwrap_or_default(),
                        content,
                        is_error: None,
                    }]),
                });
            }
            _ => {
                let text = msg.content.map(|c| c.as_text()).unwrap_or_default();
                messages.push(Message {
                    role: "user".to_string(),
                    content: MessageContent::String(text),
                });
            }
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(SystemPrompt::String(system_parts.join("\n")))
    };

    let tools = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .filter_map(|tool| {
            let function = tool.get("function")?;
            Some(ToolSpec {
                name: function.get("name")?.as_str()?.to_string(),
                description: function
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input_schema: function
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object"})),
            })
        })
        .collect();

    let stop_sequences = match request.stop {
        Some(Value::String(s)) => vec![s],
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    };

    ChatRequest {
        model: request.model,
        messages,
        system,
        tools,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.stream,
        stop_sequences,
        thinking: false,
        metadata: request.metadata,
    }
}

/// Serializes a normalized request into the OpenAI-dialect body the upstream
/// gateway speaks. `native_tools` controls whether tool specs ride in the
/// structured field or the request relies on inline markers.
pub fn build_upstream_body(request: &ChatRequest, model: &str, native_tools: bool) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system.as_text()}));
    }

    for msg in &request.messages {
        match (&msg.role[..], &msg.content) {
            ("assistant", MessageContent::Array(blocks)) => {
                let mut text_parts: Vec<String> = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => text_parts.push(text.clone()),
                        ContentBlock::Thinking { .. } => {
                            // opaque reasoning is not replayed upstream
                        }
                        ContentBlock::ToolUse { name, input, .. } if !native_tools => {
                            text_parts.push(toolcalls::render_inline(name, input));
                        }
                        _ => {}
                    }
                }
                let tool_calls = if native_tools {
                    toolcalls::render_structured(blocks)
                } else {
                    Vec::new()
                };

                let mut entry = json!({"role": "assistant"});
                entry["content"] = if text_parts.is_empty() {
                    Value::Null
                } else {
                    Value::String(text_parts.join("\n"))
                };
                if !tool_calls.is_empty() {
                    entry["tool_calls"] = Value::Array(tool_calls);
                }
                messages.push(entry);
            }
            ("user", MessageContent::Array(blocks)) => {
                let mut text_parts: Vec<String> = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => text_parts.push(text.clone()),
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            if native_tools {
                                messages.push(json!({
                                    "role": "tool",
                                    "tool_call_id": tool_use_id,
                                    "content": tool_result_text(content),
                                }));
                            } else {
                                let status = if is_error.unwrap_or(false) {
                                    "error"
                                } else {
                                    "ok"
                                };
                                text_parts.push(format!(
                                    "[Tool result {} ({})]\n{}",
                                    tool_use_id,
                                    status,
                                    tool_result_text(content)
                                ));
                            }
                        }
                        _ => {}
                    }
                }
                if !text_parts.is_empty() {
                    messages.push(json!({"role": "user", "content": text_parts.join("\n")}));
                }
            }
            (_, MessageContent::String(text)) => {
                messages.push(json!({"role": msg.role, "content": text}));
            }
            (_, MessageContent::Array(_)) => {
                messages.push(json!({"role": msg.role, "content": msg.text()}));
            }
        }
    }

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": request.stream,
    });
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if !request.stop_sequences.is_empty() {
        body["stop"] = json!(request.stop_sequences);
    }
    if native_tools && !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.input_schema,
                        }
                    })
                })
                .collect(),
        );
    }
    body
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}
