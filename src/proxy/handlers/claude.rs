use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::debug;

use super::errors::claude_error_response;
use crate::proxy::chat::estimate_request_tokens;
use crate::proxy::mappers::claude::{self, ClaudeRequest};
use crate::proxy::mappers::Dialect;
use crate::proxy::orchestrator;
use crate::proxy::state::AppState;

pub async fn handle_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return claude_error_response(
                axum::http::StatusCode::BAD_REQUEST,
                &format!("Invalid request body: {}", e),
            );
        }
    };
    let ctx = super::build_request_context(
        Dialect::AnthropicMessages,
        &headers,
        &state.config.model_routing.whitelist_header,
    );
    debug!(
        "[{}] /v1/messages: model={}, messages={}, stream={}",
        ctx.trace_id,
        request.model,
        request.messages.len(),
        request.stream
    );
    let normalized = claude::to_normalized(request);
    orchestrator::execute(state, normalized, ctx).await
}

pub async fn handle_count_tokens(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return claude_error_response(
                axum::http::StatusCode::BAD_REQUEST,
                &format!("Invalid request body: {}", e),
            );
        }
    };
    let normalized = claude::to_normalized(request);
    let chars_per_token = state.history_config.read().await.chars_per_token;
    let tokens = estimate_request_tokens(&normalized, chars_per_token);
    Json(json!({"input_tokens": tokens})).into_response()
}
