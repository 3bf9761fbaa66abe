use bytes::Bytes;
use serde_json::{json, Value};

use crate::proxy::chat::{NormalizedEvent, StopReason, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    None,
    Text,
    Thinking,
    Tool,
}

// Messages-dialect SSE emitter. One instance lives for the whole logical
// response: continuation segments reuse it, so the client sees a single
// message_start and one monotonically-indexed block sequence no matter how
// many upstream calls were stitched together.
pub struct ClaudeStreamEmitter {
    block: BlockKind,
    block_index: usize,
    message_start_sent: bool,
    message_stop_sent: bool,
    used_tool: bool,
    suppress_next_start: bool,
    message_id: String,
    model: String,
    emitted_chars: usize,
    input_tokens_estimate: u32,
    chars_per_token: f64,
}

impl ClaudeStreamEmitter {
    pub fn new(message_id: String, model: String, chars_per_token: f64) -> Self {
        Self {
            block: BlockKind::None,
            block_index: 0,
            message_start_sent: false,
            message_stop_sent: false,
            used_tool: false,
            suppress_next_start: false,
            message_id,
            model,
            emitted_chars: 0,
            input_tokens_estimate: 0,
            chars_per_token,
        }
    }

    pub fn set_input_tokens_estimate(&mut self, tokens: u32) {
        self.input_tokens_estimate = tokens;
    }

    /// Arms the emitter for a resumed segment: the segment's Start event is
    /// swallowed and deltas continue against the open block.
    pub fn begin_continuation_segment(&mut self) {
        self.suppress_next_start = true;
    }

    pub fn message_stop_sent(&self) -> bool {
        self.message_stop_sent
    }

    fn emit(&self, event_type: &str, data: Value) -> Bytes {
        Bytes::from(format!(
            "event: {}\ndata: {}\n\n",
            event_type,
            serde_json::to_string(&data).unwrap_or_default()
        ))
    }

    fn emit_message_start(&mut self) -> Vec<Bytes> {
        if self.message_start_sent {
            return Vec::new();
        }
        self.message_start_sent = true;
        vec![self.emit(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": self.input_tokens_estimate, "output_tokens": 0}
                }
            }),
        )]
    }

    fn start_block(&mut self, kind: BlockKind, content_block: Value) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if self.block != BlockKind::None {
            chunks.extend(self.end_block());
        }
        chunks.push(self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block
            }),
        ));
        self.block = kind;
        chunks
    }

    fn end_block(&mut self) -> Vec<Bytes> {
        if self.block == BlockKind::None {
            return Vec::new();
        }
        let chunk = self.emit(
            "content_block_stop",
            json!({
                "type": "content_block_stop",
                "index": self.block_index
            }),
        );
        self.block_index += 1;
        self.block = BlockKind::None;
        vec![chunk]
    }

    fn emit_delta(&self, delta: Value) -> Bytes {
        self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": delta
            }),
        )
    }

    fn ensure_started(&mut self) -> Vec<Bytes> {
        if self.message_start_sent {
            Vec::new()
        } else {
            self.emit_message_start()
        }
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
                self.emit_message_start()
            }
            NormalizedEvent::TextDelta(text) => {
                if text.is_empty() {
                    return Vec::new();
                }
                let mut chunks = self.ensure_started();
                if self.block != BlockKind::Text {
                    chunks.extend(
                        self.start_block(BlockKind::Text, json!({"type": "text", "text": ""})),
                    );
                }
                self.emitted_chars += text.len();
                chunks.push(self.emit_delta(json!({"type": "text_delta", "text": text})));
                chunks
            }
            NormalizedEvent::ThinkingDelta(text) => {
                if text.is_empty() {
                    return Vec::new();
                }
                let mut chunks = self.ensure_started();
                if self.block != BlockKind::Thinking {
                    chunks.extend(self.start_block(
                        BlockKind::Thinking,
                        json!({"type": "thinking", "thinking": ""}),
                    ));
                }
                self.emitted_chars += text.len();
                chunks
                    .push(self.emit_delta(json!({"type": "thinking_delta", "thinking": text})));
                chunks
            }
            NormalizedEvent::ToolCallStart { id, name } => {
                self.used_tool = true;
                let mut chunks = self.ensure_started();
                chunks.extend(self.start_block(
                    BlockKind::Tool,
                    json!({"type": "tool_use", "id": id, "name": name, "input": {}}),
                ));
                chunks
            }
            NormalizedEvent::ToolCallDelta { arguments } => {
                if self.block != BlockKind::Tool {
                    tracing::warn!("[W-STREAM-ORPHAN-ARGS] tool_arguments_without_open_tool_block");
                    return Vec::new();
                }
                vec![self.emit_delta(json!({
                    "type": "input_json_delta",
                    "partial_json": arguments
                }))]
            }
            NormalizedEvent::Finish { stop_reason, usage } => self.finish(*stop_reason, *usage),
            NormalizedEvent::Error(message) => self.error(message),
        }
    }

    /// Closes the message: any open block, message_delta with the final stop
    /// reason and usage, then message_stop.
    pub fn finish(&mut self, stop_reason: StopReason, usage: Option<Usage>) -> Vec<Bytes> {
        let mut chunks = self.ensure_started();
        chunks.extend(self.end_block());

        let stop_reason = if self.used_tool && stop_reason == StopReason::EndTurn {
            StopReason::ToolUse
        } else {
            stop_reason
        };
        let usage = usage.unwrap_or(Usage {
            input_tokens: self.input_tokens_estimate,
            output_tokens: (self.emitted_chars as f64 / self.chars_per_token).ceil() as u32,
        });

        chunks.push(self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason.as_str(), "stop_sequence": null},
                "usage": {
                    "input_tokens": usage.input_tokens,
                    "output_tokens": usage.output_tokens
                }
            }),
        ));

        if !self.message_stop_sent {
            chunks.push(Bytes::from(
                "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
            ));
            self.message_stop_sent = true;
        }
        chunks
    }

    /// Terminal error in-dialect; the stream still ends with message_stop so
    /// no client ever sees a torn connection.
    pub fn error(&mut self, message: &str) -> Vec<Bytes> {
        let mut chunks = self.end_block();
        chunks.push(self.emit(
            "error",
            json!({
                "type": "error",
                "error": {"type": "api_error", "message": message}
            }),
        ));
        if self.message_start_sent && !self.message_stop_sent {
            chunks.push(Bytes::from(
                "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
            ));
            self.message_stop_sent = true;
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(chunks: &[Bytes]) -> String {
        chunks
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect()
    }

    fn emitter() -> ClaudeStreamEmitter {
        ClaudeStreamEmitter::new("msg_test".to_string(), "claude-opus-4-5".to_string(), 3.0)
    }

    #[test]
    fn text_stream_produces_full_event_sequence() {
        let mut e = emitter();
        let mut out = Vec::new();
        out.extend(e.handle(&NormalizedEvent::Start {
            model: "claude-opus-4-5".to_string(),
        }));
        out.extend(e.handle(&NormalizedEvent::TextDelta("Hello".to_string())));
        out.extend(e.handle(&NormalizedEvent::TextDelta(" world".to_string())));
        out.extend(e.finish(StopReason::EndTurn, None));

        let rendered = render(&out);
        assert!(rendered.contains("event: message_start"));
        assert!(rendered.contains("event: content_block_start"));
        assert!(rendered.contains("Hello"));
        assert!(rendered.contains("event: content_block_stop"));
        assert!(rendered.contains("\"stop_reason\":\"end_turn\""));
        assert!(rendered.contains("event: message_stop"));
    }

    #[test]
    fn tool_call_closes_text_block_first() {
        let mut e = emitter();
        let mut out = Vec::new();
        out.extend(e.handle(&NormalizedEvent::TextDelta("let me check".to_string())));
        out.extend(e.handle(&NormalizedEvent::ToolCallStart {
            id: "t1".to_string(),
            name: "Read".to_string(),
        }));
        out.extend(e.handle(&NormalizedEvent::ToolCallDelta {
            arguments: "{\"path\":\"/x\"}".to_string(),
        }));
        out.extend(e.finish(StopReason::ToolUse, None));

        let rendered = render(&out);
        let text_stop = rendered.find("content_block_stop").unwrap();
        let tool_start = rendered.find("tool_use").unwrap();
        assert!(text_stop < tool_start);
        assert!(rendered.contains("input_json_delta"));
        assert!(rendered.contains("\"stop_reason\":\"tool_use\""));
    }

    #[test]
    fn continuation_segment_suppresses_message_start() {
        let mut e = emitter();
        let mut out = Vec::new();
        out.extend(e.handle(&NormalizedEvent::Start {
            model: "claude-opus-4-5".to_string(),
        }));
        out.extend(e.handle(&NormalizedEvent::TextDelta("part one".to_string())));

        e.begin_continuation_segment();
        out.extend(e.handle(&NormalizedEvent::Start {
            model: "claude-opus-4-5".to_string(),
        }));
        out.extend(e.handle(&NormalizedEvent::TextDelta(" part two".to_string())));
        out.extend(e.finish(StopReason::EndTurn, None));

        let rendered = render(&out);
        assert_eq!(rendered.matches("event: message_start").count(), 1);
        assert_eq!(rendered.matches("event: content_block_start").count(), 1);
        assert!(rendered.contains("part two"));
    }

    #[test]
    fn error_ends_with_message_stop() {
        let mut e = emitter();
        let mut out = Vec::new();
        out.extend(e.handle(&NormalizedEvent::TextDelta("some text".to_string())));
        out.extend(e.error("upstream went away"));
        let rendered = render(&out);
        assert!(rendered.contains("event: error"));
        assert!(rendered.contains("upstream went away"));
        assert!(rendered.ends_with("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));
    }

    #[test]
    fn usage_passthrough_wins_over_estimate() {
        let mut e = emitter();
        e.handle(&NormalizedEvent::TextDelta("abc".to_string()));
        let out = e.finish(
            StopReason::EndTurn,
            Some(Usage {
                input_tokens: 100,
                output_tokens: 42,
            }),
        );
        let rendered = render(&out);
        assert!(rendered.contains("\"output_tokens\":42"));
        assert!(rendered.contains("\"input_tokens\":100"));
    }
}
