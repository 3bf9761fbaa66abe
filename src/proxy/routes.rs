use axum::{
    routing::{get, post},
    Router,
};

use crate::proxy::handlers;
use crate::proxy::state::AppState;

pub fn build_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::openai::handle_root))
        .route("/v1/messages", post(handlers::claude::handle_messages))
        .route(
            "/v1/messages/count_tokens",
            post(handlers::claude::handle_count_tokens),
        )
        .route(
            "/v1/chat/completions",
            post(handlers::openai::handle_chat_completions),
        )
        .route("/v1/models", get(handlers::openai::handle_list_models))
        .route(
            "/admin/config",
            get(handlers::admin::handle_get_config).post(handlers::admin::handle_update_config),
        )
        .route(
            "/admin/routing/stats",
            get(handlers::admin::handle_routing_stats),
        )
        .route(
            "/admin/routing/reset",
            post(handlers::admin::handle_routing_reset),
        )
}
