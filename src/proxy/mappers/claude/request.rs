use super::models::ClaudeRequest;
use crate::proxy::chat::ChatRequest;

/// Lifts a Messages-dialect request into the normalized shape. Content needs
/// no translation here; the envelope fields are mapped and the thinking
/// config collapses to a flag.
pub fn to_normalized(request: ClaudeRequest) -> ChatRequest {
    let thinking = request
        .thinking
        .as_ref()
        .map(|t| t.is_enabled())
        .unwrap_or(false);

    ChatRequest {
        model: request.model,
        messages: request.messages,
        system: request.system,
        tools: request.tools.unwrap_or_default(),
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.stream,
        stop_sequences: request.stop_sequences.unwrap_or_default(),
        thinking,
        metadata: request.metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thinking_config_becomes_flag() {
        let req: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-opus-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "thinking": {"type": "enabled", "budget_tokens": 1024}
        }))
        .unwrap();
        let normalized = to_normalized(req);
        assert!(normalized.thinking);
    }

    #[test]
    fn disabled_thinking_stays_off() {
        let req: ClaudeRequest = serde_json::from_value(json!({
            "model": "claude-opus-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "thinking": {"type": "disabled"}
        }))
        .unwrap();
        assert!(!to_normalized(req).thinking);
    }
}
