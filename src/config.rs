use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncateStrategy {
    PreEstimate,
    AutoTruncate,
    SmartSummary,
    ErrorRetry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub allow_lan_access: bool,
    /// Whole-request deadline in seconds, ingress to final event.
    pub request_timeout: u64,
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8100,
            allow_lan_access: false,
            request_timeout: 300,
            max_body_size: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpPoolConfig {
    pub max_connections: usize,
    pub max_keepalive: usize,
    pub keepalive_expiry: u64,
}

impl Default for HttpPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_keepalive: 200,
            keepalive_expiry: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub max_attempts: usize,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: constants::DEFAULT_UPSTREAM_BASE_URL.to_string(),
            api_key: String::new(),
            max_attempts: 3,
            retry_base_ms: 500,
            retry_max_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub strategies: Vec<TruncateStrategy>,
    pub max_messages: usize,
    pub max_chars: usize,
    pub summary_threshold: usize,
    pub summary_keep_recent: usize,
    pub summary_max_chars: usize,
    pub retry_max_messages: usize,
    pub max_retries: usize,
    pub estimate_threshold: usize,
    pub chars_per_token: f64,
    pub merge_consecutive: bool,
    pub add_warning_header: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            strategies: vec![
                TruncateStrategy::PreEstimate,
                TruncateStrategy::AutoTruncate,
                TruncateStrategy::SmartSummary,
                TruncateStrategy::ErrorRetry,
            ],
            max_messages: 25,
            max_chars: 100_000,
            summary_threshold: 80_000,
            summary_keep_recent: 8,
            summary_max_chars: 2_000,
            retry_max_messages: 15,
            max_retries: 3,
            estimate_threshold: 100_000,
            chars_per_token: 3.0,
            merge_consecutive: true,
            add_warning_header: true,
        }
    }
}

impl HistoryConfig {
    pub fn has(&self, strategy: TruncateStrategy) -> bool {
        self.strategies.contains(&strategy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryCacheConfig {
    pub enabled: bool,
    pub min_delta_messages: usize,
    pub min_delta_chars: usize,
    pub max_age: u64,
    pub max_entries: usize,
}

impl Default for SummaryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delta_messages: 3,
            min_delta_chars: 4_000,
            max_age: 180,
            max_entries: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncSummaryConfig {
    pub enabled: bool,
    pub fast_first_request: bool,
    pub max_pending_tasks: usize,
    pub update_interval_messages: usize,
    pub task_timeout: u64,
}

impl Default for AsyncSummaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fast_first_request: true,
            max_pending_tasks: 100,
            update_interval_messages: 5,
            task_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRoutingConfig {
    pub enabled: bool,
    pub opus_model: String,
    pub sonnet_model: String,
    pub force_opus_on_thinking: bool,
    pub first_turn_opus_probability: f64,
    pub first_turn_max_user_messages: usize,
    pub execution_phase_tool_calls: usize,
    pub execution_phase_sonnet_probability: f64,
    pub base_opus_probability: f64,
    pub force_opus_keywords: Vec<String>,
    pub force_sonnet_keywords: Vec<String>,
    pub whitelist_enabled: bool,
    pub whitelist_header: String,
    pub whitelist_marker: String,
    pub log_routing_decision: bool,
}

impl Default for ModelRoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            opus_model: constants::DEFAULT_OPUS_MODEL.to_string(),
            sonnet_model: constants::DEFAULT_SONNET_MODEL.to_string(),
            force_opus_on_thinking: true,
            first_turn_opus_probability: 0.5,
            first_turn_max_user_messages: 2,
            execution_phase_tool_calls: 5,
            execution_phase_sonnet_probability: 0.85,
            base_opus_probability: 0.15,
            force_opus_keywords: vec![
                "create project".to_string(),
                "new project".to_string(),
                "system design".to_string(),
                "architecture design".to_string(),
                "complete refactor".to_string(),
                "创建项目".to_string(),
                "系统设计".to_string(),
                "架构设计".to_string(),
                "整体重构".to_string(),
            ],
            force_sonnet_keywords: vec![
                "show".to_string(),
                "list".to_string(),
                "view".to_string(),
                "fix".to_string(),
                "update".to_string(),
                "run".to_string(),
                "execute".to_string(),
                "read".to_string(),
                "search".to_string(),
                "install".to_string(),
                "debug".to_string(),
                "查看".to_string(),
                "修复".to_string(),
                "运行".to_string(),
                "搜索".to_string(),
            ],
            whitelist_enabled: true,
            whitelist_header: constants::FORCE_MODEL_HEADER.to_string(),
            whitelist_marker: constants::FORCE_OPUS_MARKER.to_string(),
            log_routing_decision: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub native_enabled: bool,
    pub native_fallback_enabled: bool,
    pub tool_desc_max_chars: usize,
    pub tool_param_desc_max_chars: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            native_enabled: true,
            native_fallback_enabled: true,
            tool_desc_max_chars: 4_000,
            tool_param_desc_max_chars: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationConfig {
    pub max_attempts: usize,
    pub min_resume_text_length: usize,
    pub continuation_max_tokens: u32,
    pub truncated_ending_chars: usize,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_resume_text_length: 50,
            continuation_max_tokens: 16_384,
            truncated_ending_chars: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub http_pool: HttpPoolConfig,
    pub upstream: UpstreamConfig,
    pub history: HistoryConfig,
    pub summary_cache: SummaryCacheConfig,
    pub async_summary: AsyncSummaryConfig,
    pub model_routing: ModelRoutingConfig,
    pub tools: ToolsConfig,
    pub continuation: ContinuationConfig,
}

pub fn load_app_config() -> Result<AppConfig, String> {
    let path = std::env::var("TIDEWAY_CONFIG").unwrap_or_else(|_| "tideway.json".to_string());
    match std::fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str(&raw)
            .map_err(|e| format!("failed_to_parse_config_file {}: {}", path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No config file at {}, using defaults", path);
            Ok(AppConfig::default())
        }
        Err(e) => Err(format!("failed_to_read_config_file {}: {}", path, e)),
    }
}

pub fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_usize(name: &str, slot: &mut usize) {
    if let Ok(v) = std::env::var(name) {
        match v.trim().parse::<usize>() {
            Ok(parsed) => {
                *slot = parsed;
                info!("Using {} from environment: {}", name, parsed);
            }
            Err(_) => warn!("[W-ENV-INVALID] ignoring_invalid_value {}={}", name, v),
        }
    }
}

fn env_u64(name: &str, slot: &mut u64) {
    if let Ok(v) = std::env::var(name) {
        match v.trim().parse::<u64>() {
            Ok(parsed) => {
                *slot = parsed;
                info!("Using {} from environment: {}", name, parsed);
            }
            Err(_) => warn!("[W-ENV-INVALID] ignoring_invalid_value {}={}", name, v),
        }
    }
}

fn env_bool(name: &str, slot: &mut bool) {
    if let Ok(v) = std::env::var(name) {
        match parse_env_bool(&v) {
            Some(parsed) => {
                *slot = parsed;
                info!("Using {} from environment: {}", name, parsed);
            }
            None => warn!("[W-ENV-INVALID] ignoring_invalid_value {}={}", name, v),
        }
    }
}

pub fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(port) = std::env::var("PORT") {
        match port.trim().parse::<u16>() {
            Ok(p) if p > 0 => {
                config.server.port = p;
                info!("Using proxy port from environment: {}", p);
            }
            _ => warn!("[W-PORT-INVALID] ignoring_invalid_port_value: {}", port),
        }
    }
    if let Ok(url) = std::env::var("UPSTREAM_BASE_URL") {
        if !url.trim().is_empty() {
            config.upstream.base_url = url.trim().trim_end_matches('/').to_string();
            info!("Using upstream base URL from environment");
        }
    }
    if let Ok(key) = std::env::var("UPSTREAM_API_KEY") {
        if !key.trim().is_empty() {
            info!("Using upstream API key from environment");
            config.upstream.api_key = key;
        }
    }

    env_bool("ALLOW_LAN_ACCESS", &mut config.server.allow_lan_access);
    env_u64("REQUEST_TIMEOUT", &mut config.server.request_timeout);

    env_usize(
        "HTTP_POOL_MAX_CONNECTIONS",
        &mut config.http_pool.max_connections,
    );
    env_usize(
        "HTTP_POOL_MAX_KEEPALIVE",
        &mut config.http_pool.max_keepalive,
    );
    env_u64(
        "HTTP_POOL_KEEPALIVE_EXPIRY",
        &mut config.http_pool.keepalive_expiry,
    );

    env_bool("NATIVE_TOOLS_ENABLED", &mut config.tools.native_enabled);
    env_bool(
        "NATIVE_TOOLS_FALLBACK_ENABLED",
        &mut config.tools.native_fallback_enabled,
    );
    env_usize("TOOL_DESC_MAX_CHARS", &mut config.tools.tool_desc_max_chars);
    env_usize(
        "TOOL_PARAM_DESC_MAX_CHARS",
        &mut config.tools.tool_param_desc_max_chars,
    );

    env_usize(
        "MAX_CONTINUATION_ATTEMPTS",
        &mut config.continuation.max_attempts,
    );
    env_usize(
        "MIN_RESUME_TEXT_LENGTH",
        &mut config.continuation.min_resume_text_length,
    );
}

fn probability_in_range(name: &str, value: f64, errors: &mut Vec<String>) {
    if !(0.0..=1.0).contains(&value) {
        errors.push(format!(
            "{} must be within [0.0, 1.0], got {}",
            name, value
        ));
    }
}

pub fn validate_app_config(config: &AppConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.history.chars_per_token <= 0.0 {
        errors.push(format!(
            "history.chars_per_token must be positive, got {}",
            config.history.chars_per_token
        ));
    }
    if config.history.max_messages < 2 {
        errors.push("history.max_messages must be at least 2".to_string());
    }
    if config.history.summary_keep_recent >= config.history.max_messages {
        errors.push(format!(
            "history.summary_keep_recent ({}) must be below history.max_messages ({})",
            config.history.summary_keep_recent, config.history.max_messages
        ));
    }

    let routing = &config.model_routing;
    probability_in_range(
        "model_routing.first_turn_opus_probability",
        routing.first_turn_opus_probability,
        &mut errors,
    );
    probability_in_range(
        "model_routing.execution_phase_sonnet_probability",
        routing.execution_phase_sonnet_probability,
        &mut errors,
    );
    probability_in_range(
        "model_routing.base_opus_probability",
        routing.base_opus_probability,
        &mut errors,
    );
    if routing.opus_model.trim().is_empty() || routing.sonnet_model.trim().is_empty() {
        errors.push("model_routing model ids must not be empty".to_string());
    }

    // Overlapping keywords are not fatal: priority order resolves them at
    // runtime (force-Opus wins), but the operator should know.
    let overlaps: Vec<&String> = routing
        .force_opus_keywords
        .iter()
        .filter(|kw| routing.force_sonnet_keywords.contains(kw))
        .collect();
    if !overlaps.is_empty() {
        warn!(
            "[W-ROUTING-KEYWORD-OVERLAP] keywords_present_in_both_sets: {:?} (force-Opus priority wins)",
            overlaps
        );
    }

    if config.continuation.max_attempts == 0 {
        errors.push("continuation.max_attempts must be at least 1".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(validate_app_config(&config).is_ok());
    }

    #[test]
    fn rejects_out_of_range_probability() {
        let mut config = AppConfig::default();
        config.model_routing.base_opus_probability = 1.5;
        let errors = validate_app_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("base_opus_probability")));
    }

    #[test]
    fn rejects_keep_recent_above_max_messages() {
        let mut config = AppConfig::default();
        config.history.summary_keep_recent = 30;
        config.history.max_messages = 25;
        assert!(validate_app_config(&config).is_err());
    }

    #[test]
    fn parse_env_bool_variants() {
        assert_eq!(parse_env_bool("1"), Some(true));
        assert_eq!(parse_env_bool("off"), Some(false));
        assert_eq!(parse_env_bool("maybe"), None);
    }

    #[test]
    fn strategy_membership() {
        let config = HistoryConfig::default();
        assert!(config.has(TruncateStrategy::SmartSummary));
        let none = HistoryConfig {
            strategies: vec![],
            ..HistoryConfig::default()
        };
        assert!(!none.has(TruncateStrategy::AutoTruncate));
    }
}
