use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{info, warn};

use crate::config::{validate_app_config, AppConfig};
use crate::proxy::state::AppState;

/// Effective configuration, secrets withheld. The hot-reloadable sections
/// are read from their live slots rather than the startup snapshot.
pub async fn handle_get_config(State(state): State<AppState>) -> Response {
    let mut effective = state.config.as_ref().clone();
    effective.history = state.history_config.read().await.clone();
    effective.tools = state.tools_config.read().await.clone();
    effective.continuation = state.continuation_config.read().await.clone();

    match serde_json::to_value(&effective) {
        Ok(config) => Json(config).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to serialize config: {}", e),
        )
            .into_response(),
    }
}

/// Hot-updates the history, tools, and continuation sections from a full
/// config body. Server, pool, upstream, and routing settings need a restart
/// and are ignored here.
pub async fn handle_update_config(
    State(state): State<AppState>,
    Json(payload): Json<AppConfig>,
) -> Response {
    if let Err(errors) = validate_app_config(&payload) {
        warn!(
            "[W-CONFIG-UPDATE-REJECTED] invalid_config_payload: {}",
            errors.join("; ")
        );
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"errors": errors})),
        )
            .into_response();
    }

    {
        let mut history = state.history_config.write().await;
        *history = payload.history;
    }
    {
        let mut tools = state.tools_config.write().await;
        *tools = payload.tools;
    }
    {
        let mut continuation = state.continuation_config.write().await;
        *continuation = payload.continuation;
    }

    info!("History, tools, and continuation config hot-reloaded via admin endpoint");
    StatusCode::OK.into_response()
}

pub async fn handle_routing_stats(State(state): State<AppState>) -> Response {
    Json(state.router.stats()).into_response()
}

pub async fn handle_routing_reset(State(state): State<AppState>) -> Response {
    state.router.reset_stats();
    tracing::info!("Routing statistics reset via admin endpoint");
    StatusCode::OK.into_response()
}
