use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::debug;

use super::errors::openai_error_response;
use crate::proxy::mappers::openai::{self, OpenAIRequest};
use crate::proxy::mappers::Dialect;
use crate::proxy::orchestrator;
use crate::proxy::state::AppState;

pub async fn handle_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let request: OpenAIRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return openai_error_response(
                axum::http::StatusCode::BAD_REQUEST,
                &format!("Invalid request body: {}", e),
            );
        }
    };
    let ctx = super::build_request_context(
        Dialect::OpenAiChat,
        &headers,
        &state.config.model_routing.whitelist_header,
    );
    debug!(
        "[{}] /v1/chat/completions: model={}, messages={}, stream={}",
        ctx.trace_id,
        request.model,
        request.messages.len(),
        request.stream
    );
    let normalized = openai::to_normalized(request);
    orchestrator::execute(state, normalized, ctx).await
}

/// Static catalog: the two tiers this proxy serves.
pub async fn handle_list_models(State(state): State<AppState>) -> Response {
    let routing = &state.config.model_routing;
    let created = chrono::Utc::now().timestamp();
    Json(json!({
        "object": "list",
        "data": [
            {
                "id": routing.opus_model,
                "object": "model",
                "created": created,
                "owned_by": "tideway"
            },
            {
                "id": routing.sonnet_model,
                "object": "model",
                "created": created,
                "owned_by": "tideway"
            }
        ]
    }))
    .into_response()
}

pub async fn handle_root() -> Response {
    Json(json!({
        "status": "ok",
        "service": "tideway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}
