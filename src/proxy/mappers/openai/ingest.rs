use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::proxy::chat::{NormalizedEvent, StopReason, Usage};

// Upstream SSE decoder: reassembles `data:` lines from the byte stream and
// turns chat-completion chunks into normalized events. Unknown payloads are
// skipped with a warning; a malformed line never kills the stream.
pub struct SseChunkParser {
    buffer: BytesMut,
    started: bool,
    finished: bool,
    usage: Option<Usage>,
}

impl SseChunkParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            started: false,
            finished: false,
            usage: None,
        }
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Feeds one network chunk, returning every event completed by it.
    pub fn push(&mut self, chunk: &Bytes) -> Vec<NormalizedEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_raw = self.buffer.split_to(pos + 1);
            let Ok(line) = std::str::from_utf8(&line_raw) else {
                tracing::warn!("[W-SSE-UTF8] dropping_non_utf8_line ({} bytes)", line_raw.len());
                continue;
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
                continue;
            }
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                if !self.finished {
                    self.finished = true;
                    events.push(NormalizedEvent::Finish {
                        stop_reason: StopReason::EndTurn,
                        usage: self.usage,
                    });
                }
                continue;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(json) => events.extend(self.handle_chunk(&json)),
                Err(e) => {
                    tracing::warn!("[W-SSE-PARSE] skipping_malformed_chunk: {}", e);
                }
            }
        }
        events
    }

    /// End-of-stream: emits a synthetic finish if the upstream never sent one.
    pub fn close(&mut self) -> Vec<NormalizedEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        tracing::warn!("[W-SSE-TRUNCATED] upstream_stream_ended_without_done");
        vec![NormalizedEvent::Finish {
            stop_reason: StopReason::EndTurn,
            usage: self.usage,
        }]
    }

    fn handle_chunk(&mut self, json: &Value) -> Vec<NormalizedEvent> {
        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            events.push(NormalizedEvent::Start {
                model: json
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }

        if let Some(usage) = json.get("usage") {
            if usage.is_object() {
                self.usage = Some(Usage {
                    input_tokens: usage
                        .get("prompt_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32,
                    output_tokens: usage
                        .get("completion_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32,
                });
            }
        }

        let Some(choice) = json.get("choices").and_then(|c| c.get(0)) else {
            return events;
        };

        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    events.push(NormalizedEvent::TextDelta(text.to_string()));
                }
            }
            if let Some(reasoning) = delta.get("reasoning_content").and_then(Value::as_str) {
                if !reasoning.is_empty() {
                    events.push(NormalizedEvent::ThinkingDelta(reasoning.to_string()));
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for call in calls {
                    let id = call.get("id").and_then(Value::as_str);
                    let name = call.pointer("/function/name").and_then(Value::as_str);
                    if let (Some(id), Some(name)) = (id, name) {
                        events.push(NormalizedEvent::ToolCallStart {
                            id: id.to_string(),
                            name: name.to_string(),
                        });
                    }
                    if let Some(arguments) =
                        call.pointer("/function/arguments").and_then(Value::as_str)
                    {
                        if !arguments.is_empty() {
                            events.push(NormalizedEvent::ToolCallDelta {
                                arguments: arguments.to_string(),
                            });
                        }
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finished = true;
            events.push(NormalizedEvent::Finish {
                stop_reason: StopReason::from_openai_finish(reason),
                usage: self.usage,
            });
        }

        events
    }
}

impl Default for SseChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut SseChunkParser, lines: &[&str]) -> Vec<NormalizedEvent> {
        let mut events = Vec::new();
        for line in lines {
            events.extend(parser.push(&Bytes::from(format!("{}\n", line))));
        }
        events
    }

    #[test]
    fn text_chunks_become_deltas() {
        let mut parser = SseChunkParser::new();
        let events = feed(
            &mut parser,
            &[
                r#"data: {"model":"claude-sonnet-4-5","choices":[{"delta":{"role":"assistant","content":"Hel"}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
                r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":2}}"#,
                "data: [DONE]",
            ],
        );
        assert!(matches!(&events[0], NormalizedEvent::Start { model } if model == "claude-sonnet-4-5"));
        assert_eq!(events[1], NormalizedEvent::TextDelta("Hel".to_string()));
        assert_eq!(events[2], NormalizedEvent::TextDelta("lo".to_string()));
        assert!(matches!(
            events[3],
            NormalizedEvent::Finish {
                stop_reason: StopReason::EndTurn,
                usage: Some(Usage {
                    input_tokens: 5,
                    output_tokens: 2
                })
            }
        ));
        // [DONE] after an explicit finish adds nothing
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn length_finish_reason_maps_to_max_tokens() {
        let mut parser = SseChunkParser::new();
        let events = feed(
            &mut parser,
            &[r#"data: {"choices":[{"delta":{"content":"x"},"finish_reason":"length"}]}"#],
        );
        assert!(matches!(
            events.last(),
            Some(NormalizedEvent::Finish {
                stop_reason: StopReason::MaxTokens,
                ..
            })
        ));
    }

    #[test]
    fn tool_call_chunks_stream_arguments() {
        let mut parser = SseChunkParser::new();
        let events = feed(
            &mut parser,
            &[
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"t1","function":{"name":"Read","arguments":""}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\":"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"/x\"}"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            ],
        );
        assert!(events.iter().any(|e| matches!(
            e,
            NormalizedEvent::ToolCallStart { id, name } if id == "t1" && name == "Read"
        )));
        let args: String = events
            .iter()
            .filter_map(|e| match e {
                NormalizedEvent::ToolCallDelta { arguments } => Some(arguments.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(args, "{\"path\":\"/x\"}");
    }

    #[test]
    fn malformed_chunk_does_not_kill_stream() {
        let mut parser = SseChunkParser::new();
        let events = feed(
            &mut parser,
            &[
                "data: {broken json",
                r#"data: {"choices":[{"delta":{"content":"ok"}}]}"#,
            ],
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, NormalizedEvent::TextDelta(t) if t == "ok")));
    }

    #[test]
    fn close_synthesizes_finish_for_torn_stream() {
        let mut parser = SseChunkParser::new();
        feed(
            &mut parser,
            &[r#"data: {"choices":[{"delta":{"content":"partial"}}]}"#],
        );
        let events = parser.close();
        assert!(matches!(events[0], NormalizedEvent::Finish { .. }));
        assert!(parser.finished());
    }

    #[test]
    fn split_lines_across_network_chunks() {
        let mut parser = SseChunkParser::new();
        let mut events = parser.push(&Bytes::from(r#"data: {"choices":[{"delta":{"con"#));
        assert!(events.is_empty());
        events.extend(parser.push(&Bytes::from("tent\":\"joined\"}}]}\n")));
        assert!(events
            .iter()
            .any(|e| matches!(e, NormalizedEvent::TextDelta(t) if t == "joined")));
    }
}
