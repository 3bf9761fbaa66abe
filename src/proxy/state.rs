use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::{AppConfig, ContinuationConfig, HistoryConfig, ToolsConfig};
use crate::proxy::history::{BackgroundSummarizer, SummaryCache};
use crate::proxy::router::ModelRouter;
use crate::proxy::upstream::UpstreamClient;

// Process-lifetime singletons, initialized once at worker start. Nothing here
// survives a restart and nothing is shared across workers.
//
// `config` is the startup snapshot; the history, tools, and continuation
// sections also live behind RwLocks so the admin endpoint can hot-update
// them. Server, pool, upstream, and routing settings are fixed for the life
// of the worker.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub history_config: Arc<RwLock<HistoryConfig>>,
    pub tools_config: Arc<RwLock<ToolsConfig>>,
    pub continuation_config: Arc<RwLock<ContinuationConfig>>,
    pub upstream: Arc<UpstreamClient>,
    pub router: Arc<ModelRouter>,
    pub summary_cache: Arc<SummaryCache>,
    pub background: Arc<BackgroundSummarizer>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let config = Arc::new(config);
        let upstream = Arc::new(UpstreamClient::new(
            &config.upstream,
            &config.http_pool,
            config.server.request_timeout,
        ));
        let router = Arc::new(ModelRouter::new(config.model_routing.clone()));
        let summary_cache = Arc::new(SummaryCache::new(config.summary_cache.clone()));
        let background = Arc::new(BackgroundSummarizer::new(
            config.async_summary.clone(),
            summary_cache.clone(),
        ));
        Self {
            history_config: Arc::new(RwLock::new(config.history.clone())),
            tools_config: Arc::new(RwLock::new(config.tools.clone())),
            continuation_config: Arc::new(RwLock::new(config.continuation.clone())),
            config,
            upstream,
            router,
            summary_cache,
            background,
        }
    }

    #[cfg(test)]
    pub fn for_test(mut config: AppConfig, upstream_base_url: &str, seed: u64) -> Self {
        config.upstream.base_url = upstream_base_url.to_string();
        config.upstream.retry_base_ms = 1;
        config.upstream.retry_max_ms = 5;
        let config = Arc::new(config);
        let upstream = Arc::new(UpstreamClient::new(
            &config.upstream,
            &config.http_pool,
            config.server.request_timeout,
        ));
        let router = Arc::new(ModelRouter::with_seed(config.model_routing.clone(), seed));
        let summary_cache = Arc::new(SummaryCache::new(config.summary_cache.clone()));
        let background = Arc::new(BackgroundSummarizer::new(
            config.async_summary.clone(),
            summary_cache.clone(),
        ));
        Self {
            history_config: Arc::new(RwLock::new(config.history.clone())),
            tools_config: Arc::new(RwLock::new(config.tools.clone())),
            continuation_config: Arc::new(RwLock::new(config.continuation.clone())),
            config,
            upstream,
            router,
            summary_cache,
            background,
        }
    }
}

impl axum::extract::FromRef<AppState> for Arc<ModelRouter> {
    fn from_ref(state: &AppState) -> Self {
        state.router.clone()
    }
}

impl axum::extract::FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}
