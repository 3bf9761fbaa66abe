use bytes::Bytes;
use serde_json::{json, Value};

use crate::proxy::chat::{NormalizedEvent, StopReason, Usage};

// Chat-completions chunk emitter. Mirrors the Messages-dialect emitter:
// one instance per logical response, continuation segments suppress the
// repeated role chunk, and the stream always terminates with [DONE].
pub struct OpenAIStreamEmitter {
    response_id: String,
    model: String,
    created: i64,
    role_sent: bool,
    done_sent: bool,
    suppress_next_start: bool,
    tool_index: i64,
    tool_open: bool,
    emitted_chars: usize,
    chars_per_token: f64,
}

impl OpenAIStreamEmitter {
    pub fn new(response_id: String, model: String, chars_per_token: f64) -> Self {
        Self {
            response_id,
            model,
            created: chrono::Utc::now().timestamp(),
            role_sent: false,
            done_sent: false,
            suppress_next_start: false,
            tool_index: -1,
            tool_open: false,
            emitted_chars: 0,
            chars_per_token,
        }
    }

    pub fn begin_continuation_segment(&mut self) {
        self.suppress_next_start = true;
    }

    pub fn done_sent(&self) -> bool {
        self.done_sent
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Bytes {
        self.chunk_with_usage(delta, finish_reason, None)
    }

    fn chunk_with_usage(
        &self,
        delta: Value,
        finish_reason: Option<&str>,
        usage: Option<&Usage>,
    ) -> Bytes {
        let mut body = json!({
            "id": self.response_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }]
        });
        if let Some(usage) = usage {
            body["usage"] = json!({
                "prompt_tokens": usage.input_tokens,
                "completion_tokens": usage.output_tokens,
                "total_tokens": usage.input_tokens + usage.output_tokens,
            });
        }
        Bytes::from(format!(
            "data: {}\n\n",
            serde_json::to_string(&body).unwrap_or_default()
        ))
    }

    fn ensure_role(&mut self) -> Vec<Bytes> {
        if self.role_sent {
            return Vec::new();
        }
        self.role_sent = true;
        vec![self.chunk(json!({"role": "assistant"}), None)]
    }

    pub fn handle(&mut self, event: &NormalizedEvent) -> Vec<Bytes> {
        match event {
            NormalizedEvent::Start { model } => {
                if self.suppress_next_start {
                    self.suppress_next_start = false;
                    return Vec::new();
                }
                if !model.is_empty() {
                    self.model = model.clone();
                }
                self.ensure_role()
            }
            NormalizedEvent::TextDelta(text) => {
                if text.is_empty() {
                    return Vec::new();
                }
                let mut chunks = self.ensure_role();
                self.emitted_chars += text.len();
                chunks.push(self.chunk(json!({"content": text}), None));
                chunks
            }
            // the chat-completions dialect has no reasoning channel of its
            // own; pass it through under the de-facto field name
            NormalizedEvent::ThinkingDelta(text) => {
                if text.is_empty() {
                    return Vec::new();
                }
                let mut chunks = self.ensure_role();
                chunks.push(self.chunk(json!({"reasoning_content": text}), None));
                chunks
            }
            NormalizedEvent::ToolCallStart { id, name } => {
                let mut chunks = self.ensure_role();
                self.tool_index += 1;
                self.tool_open = true;
                chunks.push(self.chunk(
                    json!({"tool_calls": [{
                        "index": self.tool_index,
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": ""}
                    }]}),
                    None,
                ));
                chunks
            }
            NormalizedEvent::ToolCallDelta { arguments } => {
                if !self.tool_open {
                    tracing::warn!("[W-STREAM-ORPHAN-ARGS] tool_arguments_without_open_call");
                    return Vec::new();
                }
                vec![self.chunk(
                    json!({"tool_calls": [{
                        "index": self.tool_index,
                        "function": {"arguments": arguments}
                    }]}),
                    None,
                )]
            }
            NormalizedEvent::Finish { stop_reason, usage } => self.finish(*stop_reason, *usage),
            NormalizedEvent::Error(message) => self.error(message),
        }
    }

    pub fn finish(&mut self, stop_reason: StopReason, usage: Option<Usage>) -> Vec<Bytes> {
        let mut chunks = self.ensure_role();
        let usage = usage.unwrap_or(Usage {
            input_tokens: 0,
            output_tokens: (self.emitted_chars as f64 / self.chars_per_token).ceil() as u32,
        });
        chunks.push(self.chunk_with_usage(
            json!({}),
            Some(stop_reason.to_openai_finish()),
            Some(&usage),
        ));
        if !self.done_sent {
            chunks.push(Bytes::from("data: [DONE]\n\n"));
            self.done_sent = true;
        }
        chunks
    }

    pub fn error(&mut self, message: &str) -> Vec<Bytes> {
        let body = json!({
            "error": {
                "message": message,
                "type": "upstream_error",
            }
        });
        let mut chunks = vec![Bytes::from(format!(
            "data: {}\n\n",
            serde_json::to_string(&body).unwrap_or_default()
        ))];
        if !self.done_sent {
            chunks.push(Bytes::from("data: [DONE]\n\n"));
            self.done_sent = true;
        }
        chunks
    }
}
