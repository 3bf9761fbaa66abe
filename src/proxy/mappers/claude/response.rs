use serde_json::{json, Value};

use crate::proxy::chat::ChatResponse;

/// Renders a normalized response as a Messages-dialect body.
pub fn render_response(response: &ChatResponse) -> Value {
    json!({
        "id": response.id,
        "type": "message",
        "role": "assistant",
        "model": response.model,
        "content": response.content,
        "stop_reason": response.stop_reason.as_str(),
        "stop_sequence": null,
        "usage": {
            "input_tokens": response.usage.input_tokens,
            "output_tokens": response.usage.output_tokens,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::chat::{ContentBlock, StopReason, Usage};

    #[test]
    fn renders_text_and_tool_blocks() {
        let response = ChatResponse {
            id: "msg_abc".to_string(),
            model: "claude-opus-4-5".to_string(),
            content: vec![
                ContentBlock::Text {
                    text: "done".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "Read".to_string(),
                    input: serde_json::json!({"path": "/x"}),
                },
            ],
            stop_reason: StopReason::ToolUse,
            usage: Usage {
                input_tokens: 12,
                output_tokens: 34,
            },
        };
        let body = render_response(&response);
        assert_eq!(body["type"], "message");
        assert_eq!(body["stop_reason"], "tool_use");
        assert_eq!(body["content"][0]["type"], "text");
        assert_eq!(body["content"][1]["type"], "tool_use");
        assert_eq!(body["content"][1]["id"], "t1");
        assert_eq!(body["usage"]["output_tokens"], 34);
    }
}
