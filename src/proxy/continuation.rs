use tracing::{debug, info, warn};

use crate::config::ContinuationConfig;
use crate::constants;
use crate::proxy::chat::{ChatRequest, Message, StopReason};
use crate::proxy::toolcalls;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationCheck {
    pub truncated: bool,
    pub reason: &'static str,
}

impl TruncationCheck {
    pub fn none() -> Self {
        Self {
            truncated: false,
            reason: "",
        }
    }

    fn yes(reason: &'static str) -> Self {
        Self {
            truncated: true,
            reason,
        }
    }
}

/// Decides whether a finished segment looks cut off. The stop reason is
/// authoritative; the structural checks only catch upstreams that truncate
/// without saying so, and only the high-confidence shapes count.
pub fn detect_truncation(text: &str, stop_reason: StopReason) -> TruncationCheck {
    if stop_reason == StopReason::MaxTokens {
        return TruncationCheck::yes("max_tokens");
    }
    if stop_reason != StopReason::EndTurn {
        return TruncationCheck::none();
    }
    if text.matches("```").count() % 2 == 1 {
        return TruncationCheck::yes("unclosed_code_block");
    }
    if toolcalls::has_incomplete_tool_call(text) {
        return TruncationCheck::yes("incomplete_tool_call");
    }
    TruncationCheck::none()
}

/// Per-request resume bookkeeping: the text emitted so far and how many
/// upstream segments produced it. One segment equals one attempt.
pub struct ContinuationState {
    config: ContinuationConfig,
    accumulated_text: String,
    segments: usize,
}

impl ContinuationState {
    pub fn new(config: ContinuationConfig) -> Self {
        Self {
            config,
            accumulated_text: String::new(),
            segments: 0,
        }
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn segments(&self) -> usize {
        self.segments
    }

    /// Folds one segment's text in, trimming any overlap the model repeated
    /// from the previous segment's tail.
    pub fn record_segment(&mut self, text: &str) -> String {
        self.segments += 1;
        let effective = if self.segments == 1 {
            text.to_string()
        } else {
            let trimmed = trim_overlap(&self.accumulated_text, text);
            if trimmed.len() != text.len() {
                info!(
                    "Continuation overlap removed: {} chars",
                    text.len() - trimmed.len()
                );
            }
            trimmed.to_string()
        };
        self.accumulated_text.push_str(&effective);
        effective
    }

    /// Resume preconditions: the segment was truncated, we still have
    /// attempts left, and there is enough emitted text to anchor a resume.
    /// An empty or near-empty segment aborts instead of looping on
    /// malformed-request errors.
    pub fn should_resume(&self, check: TruncationCheck) -> bool {
        if !check.truncated {
            return false;
        }
        if self.segments >= self.config.max_attempts {
            warn!(
                "[W-CONTINUATION-CAP] max_continuation_attempts_reached ({})",
                self.config.max_attempts
            );
            return false;
        }
        if self.accumulated_text.len() < self.config.min_resume_text_length {
            warn!(
                "[W-CONTINUATION-ABORT] emitted_text_below_resume_threshold ({} < {})",
                self.accumulated_text.len(),
                self.config.min_resume_text_length
            );
            return false;
        }
        true
    }

    /// Original history plus the partial answer and a resume instruction.
    pub fn build_resume_request(&self, base: &ChatRequest) -> ChatRequest {
        let ending_chars = self.config.truncated_ending_chars;
        let ending = tail_chars(&self.accumulated_text, ending_chars);

        let mut messages = base.messages.clone();
        messages.push(Message::assistant(self.accumulated_text.clone()));
        messages.push(Message::user(format!(
            "{}\n\nYour response ended with:\n```\n{}\n```\n\nContinue directly:",
            constants::CONTINUE_PROMPT,
            ending
        )));

        let mut request = base.clone();
        request.messages = messages;
        request.max_tokens = Some(self.config.continuation_max_tokens);
        debug!(
            "Built resume request #{}: {} messages, {} accumulated chars",
            self.segments + 1,
            request.messages.len(),
            self.accumulated_text.len()
        );
        request
    }
}

fn tail_chars(text: &str, count: usize) -> &str {
    if text.len() <= count {
        return text;
    }
    let mut idx = text.len() - count;
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    &text[idx..]
}

/// Strips the longest prefix of `continuation` that repeats the tail of
/// `original` (up to 200 chars of lookback).
fn trim_overlap<'a>(original: &str, continuation: &'a str) -> &'a str {
    if original.is_empty() || continuation.is_empty() {
        return continuation;
    }
    let ending = tail_chars(original, 200);
    let max = ending.len().min(continuation.len());
    for i in (1..=max).rev() {
        if !ending.is_char_boundary(ending.len() - i) {
            continue;
        }
        let suffix = &ending[ending.len() - i..];
        if continuation.starts_with(suffix) {
            return &continuation[i..];
        }
    }
    continuation
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ContinuationConfig {
        ContinuationConfig {
            max_attempts: 3,
            min_resume_text_length: 50,
            continuation_max_tokens: 16_384,
            truncated_ending_chars: 500,
        }
    }

    fn base_request() -> ChatRequest {
        ChatRequest {
            model: "claude-opus-4-5".to_string(),
            messages: vec![Message::user("write a long story")],
            system: None,
            tools: vec![],
            max_tokens: Some(4096),
            temperature: None,
            top_p: None,
            stream: true,
            stop_sequences: vec![],
            thinking: false,
            metadata: None,
        }
    }

    #[test]
    fn max_tokens_is_truncation() {
        let check = detect_truncation("anything", StopReason::MaxTokens);
        assert!(check.truncated);
        assert_eq!(check.reason, "max_tokens");
    }

    #[test]
    fn odd_code_fences_are_truncation() {
        let check = detect_truncation("here is code:\n```rust\nfn main()", StopReason::EndTurn);
        assert!(check.truncated);
        assert_eq!(check.reason, "unclosed_code_block");
    }

    #[test]
    fn complete_answer_is_not_truncation() {
        let check = detect_truncation("all done.\n```rust\nfn main() {}\n```\n", StopReason::EndTurn);
        assert!(!check.truncated);
        assert!(!detect_truncation("fine", StopReason::ToolUse).truncated);
    }

    #[test]
    fn resume_respects_attempt_cap() {
        let mut state = ContinuationState::new(config());
        state.record_segment(&"x".repeat(100));
        let check = detect_truncation("", StopReason::MaxTokens);
        assert!(state.should_resume(check));
        state.record_segment(&"y".repeat(100));
        assert!(state.should_resume(check));
        state.record_segment(&"z".repeat(100));
        // three segments issued, the cap is reached
        assert!(!state.should_resume(check));
    }

    #[test]
    fn resume_aborts_on_short_text() {
        let mut state = ContinuationState::new(config());
        state.record_segment("tiny");
        assert!(!state.should_resume(detect_truncation("tiny", StopReason::MaxTokens)));
    }

    #[test]
    fn resume_aborts_on_empty_text() {
        let state = ContinuationState::new(config());
        assert!(!state.should_resume(detect_truncation("", StopReason::MaxTokens)));
    }

    #[test]
    fn resume_request_carries_partial_answer() {
        let mut state = ContinuationState::new(config());
        state.record_segment(&format!("Once upon a time{}", "x".repeat(100)));
        let resume = state.build_resume_request(&base_request());
        assert_eq!(resume.messages.len(), 3);
        assert_eq!(resume.messages[1].role, "assistant");
        assert!(resume.messages[1].text().starts_with("Once upon a time"));
        assert_eq!(resume.messages[2].role, "user");
        assert!(resume.messages[2].text().contains("Continue"));
        assert_eq!(resume.max_tokens, Some(16_384));
    }

    #[test]
    fn overlap_between_segments_is_trimmed() {
        let mut state = ContinuationState::new(config());
        state.record_segment("The quick brown fox jumps");
        let effective = state.record_segment(" jumps over the lazy dog");
        assert_eq!(effective, " over the lazy dog");
        assert_eq!(
            state.accumulated_text(),
            "The quick brown fox jumps over the lazy dog"
        );
    }

    #[test]
    fn accumulated_length_is_monotonic() {
        let mut state = ContinuationState::new(config());
        let mut prev = 0;
        for segment in ["first part, ", "second part, ", "third part"] {
            state.record_segment(segment);
            assert!(state.accumulated_text().len() >= prev);
            prev = state.accumulated_text().len();
        }
        assert_eq!(state.segments(), 3);
    }
}
