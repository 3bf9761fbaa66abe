pub mod claude;
pub mod openai;

use crate::proxy::chat::NormalizedEvent;
use crate::proxy::toolcalls;

/// Which wire shape a client spoke on the way in; responses are emitted in
/// the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    AnthropicMessages,
    OpenAiChat,
}

// Legacy-mode filter: the upstream emits tool invocations as inline
// `[Calling tool: ...]` text. Text deltas are held back while a marker unit
// is open and replayed as structured tool-call events once it resolves.
#[derive(Default)]
pub struct InlineToolFilter {
    buffer: String,
    buffering: bool,
}

impl InlineToolFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: NormalizedEvent) -> Vec<NormalizedEvent> {
        match event {
            NormalizedEvent::TextDelta(text) => self.push_text(&text),
            other => {
                let mut out = self.flush();
                out.push(other);
                out
            }
        }
    }

    fn push_text(&mut self, text: &str) -> Vec<NormalizedEvent> {
        self.buffer.push_str(text);

        if !self.buffering {
            if let Some(pos) = self.buffer.find(toolcalls::TOOL_MARKER) {
                let mut out = Vec::new();
                if pos > 0 {
                    out.push(NormalizedEvent::TextDelta(self.buffer[..pos].to_string()));
                    self.buffer.drain(..pos);
                }
                self.buffering = true;
                out.extend(self.try_resolve());
                return out;
            }
            // a marker may be split across deltas; hold back a partial match
            // at the tail
            let holdback = self.partial_marker_len();
            if self.buffer.len() > holdback {
                let emit_len = self.buffer.len() - holdback;
                let emitted: String = self.buffer.drain(..emit_len).collect();
                return vec![NormalizedEvent::TextDelta(emitted)];
            }
            return Vec::new();
        }

        self.try_resolve()
    }

    fn partial_marker_len(&self) -> usize {
        let marker = toolcalls::TOOL_MARKER;
        let max = marker.len().min(self.buffer.len());
        for len in (1..=max).rev() {
            if self.buffer.ends_with(&marker[..len]) {
                return len;
            }
        }
        0
    }

    fn try_resolve(&mut self) -> Vec<NormalizedEvent> {
        if toolcalls::has_incomplete_tool_call(&self.buffer) {
            return Vec::new();
        }
        let extracted = toolcalls::extract_blocks(&self.buffer);
        let mut out = Vec::new();
        if !extracted.prefix_text.is_empty() {
            out.push(NormalizedEvent::TextDelta(extracted.prefix_text));
        }
        for call in extracted.calls {
            let arguments =
                serde_json::to_string(&call.input).unwrap_or_else(|_| "{}".to_string());
            out.push(NormalizedEvent::ToolCallStart {
                id: call.id,
                name: call.name,
            });
            out.push(NormalizedEvent::ToolCallDelta { arguments });
        }
        self.buffer.clear();
        self.buffering = false;
        if !extracted.suffix_text.is_empty() {
            // suffix may itself open another marker
            out.extend(self.push_text(&extracted.suffix_text));
        }
        out
    }

    /// Drains whatever is left at end of stream. An unresolved unit is
    /// emitted as plain text rather than dropped.
    pub fn flush(&mut self) -> Vec<NormalizedEvent> {
        if self.buffer.is_empty() {
            self.buffering = false;
            return Vec::new();
        }
        let rest = std::mem::take(&mut self.buffer);
        self.buffering = false;
        let extracted = toolcalls::extract_blocks(&rest);
        let mut out = Vec::new();
        if !extracted.prefix_text.is_empty() {
            out.push(NormalizedEvent::TextDelta(extracted.prefix_text));
        }
        for call in extracted.calls {
            let arguments =
                serde_json::to_string(&call.input).unwrap_or_else(|_| "{}".to_string());
            out.push(NormalizedEvent::ToolCallStart {
                id: call.id,
                name: call.name,
            });
            out.push(NormalizedEvent::ToolCallDelta { arguments });
        }
        if !extracted.suffix_text.is_empty() {
            out.push(NormalizedEvent::TextDelta(extracted.suffix_text));
        }
        out
    }
}
