use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::AppError;
use crate::proxy::mappers::Dialect;

fn claude_error_type(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        413 => "request_too_large",
        422 => "invalid_request_error",
        429 => "rate_limit_error",
        529 => "overloaded_error",
        500 => "api_error",
        _ => "api_error",
    }
}

pub fn claude_error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "type": "error",
            "error": {
                "type": claude_error_type(status),
                "message": message,
            }
        })),
    )
        .into_response()
}

pub fn openai_error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "message": message,
                "type": "invalid_request_error",
                "code": status.as_u16(),
            }
        })),
    )
        .into_response()
}

fn status_for(error: &AppError) -> StatusCode {
    match error {
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::Normalization(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AppError::UpstreamLength { status, .. } | AppError::Upstream { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        AppError::Network(_) => StatusCode::BAD_GATEWAY,
        AppError::StreamFormat(_) => StatusCode::BAD_GATEWAY,
        AppError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        AppError::Invariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Renders any internal failure as a well-formed body in the caller's
/// dialect. Internal invariant violations carry the request id so the log
/// line can be found.
pub fn error_response(dialect: Dialect, error: &AppError, trace_id: &str) -> Response {
    let status = status_for(error);
    let message = match error {
        AppError::Invariant(msg) => {
            format!("internal error (request {}): {}", trace_id, msg)
        }
        other => other.to_string(),
    };
    match dialect {
        Dialect::AnthropicMessages => claude_error_response(status, &message),
        Dialect::OpenAiChat => openai_error_response(status, &message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_400() {
        let err = AppError::Validation("missing field".to_string());
        assert_eq!(status_for(&err), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn normalization_maps_to_422() {
        let err = AppError::Normalization("tool_x".to_string());
        assert_eq!(status_for(&err), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn invariant_maps_to_500() {
        let err = AppError::Invariant("alternation".to_string());
        assert_eq!(status_for(&err), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn upstream_status_passes_through() {
        let err = AppError::Upstream {
            status: 429,
            message: "slow down".to_string(),
        };
        assert_eq!(status_for(&err), StatusCode::TOO_MANY_REQUESTS);
    }
}
