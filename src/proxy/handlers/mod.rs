pub mod admin;
pub mod claude;
pub mod errors;
pub mod openai;

use axum::http::HeaderMap;

use crate::proxy::mappers::Dialect;
use crate::proxy::orchestrator::RequestContext;

pub(crate) fn build_request_context(dialect: Dialect, headers: &HeaderMap, force_model_header: &str) -> RequestContext {
    let client_bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let force_model = headers
        .get(force_model_header)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let anthropic_version = headers
        .get(crate::constants::ANTHROPIC_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    RequestContext {
        dialect,
        trace_id: crate::proxy::orchestrator::generate_trace_id(),
        force_model_header: force_model,
        client_bearer,
        anthropic_version,
    }
}
