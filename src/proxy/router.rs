use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;

use crate::config::ModelRoutingConfig;
use crate::proxy::chat::{count_tool_calls, count_user_messages, last_user_text, ChatRequest};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoutingDecision {
    pub model: String,
    pub reason: String,
    pub priority: u8,
}

#[derive(Default)]
struct RoutingCounters {
    opus: AtomicU64,
    sonnet: AtomicU64,
}

// Priority-ordered tier selection. The first matching rule wins; the order
// is part of the contract so the policy stays auditable from logs alone.
pub struct ModelRouter {
    config: ModelRoutingConfig,
    counters: RoutingCounters,
    reasons: Mutex<HashMap<String, u64>>,
    rng: Mutex<StdRng>,
}

enum Tier {
    Opus,
    Sonnet,
}

impl ModelRouter {
    pub fn new(config: ModelRoutingConfig) -> Self {
        Self {
            config,
            counters: RoutingCounters::default(),
            reasons: Mutex::new(HashMap::new()),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic draws for tests and replayable decisions.
    pub fn with_seed(config: ModelRoutingConfig, seed: u64) -> Self {
        Self {
            config,
            counters: RoutingCounters::default(),
            reasons: Mutex::new(HashMap::new()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn draw(&self, probability: f64) -> bool {
        if probability >= 1.0 {
            return true;
        }
        if probability <= 0.0 {
            return false;
        }
        match self.rng.lock() {
            Ok(mut rng) => rng.gen::<f64>() < probability,
            Err(_) => false,
        }
    }

    fn decide(&self, request: &ChatRequest, force_header: Option<&str>) -> (Tier, String, u8) {
        let config = &self.config;
        let last_user = last_user_text(&request.messages);

        // 0: whitelist
        if config.whitelist_enabled {
            if force_header
                .map(|v| v.eq_ignore_ascii_case("opus"))
                .unwrap_or(false)
            {
                return (Tier::Opus, "whitelist_header".to_string(), 0);
            }
            if last_user.contains(&config.whitelist_marker) {
                return (Tier::Opus, "whitelist_marker".to_string(), 0);
            }
        }

        // 1: extended thinking
        if config.force_opus_on_thinking && request.thinking {
            return (Tier::Opus, "extended_thinking".to_string(), 1);
        }

        // 1: first turn of a new task
        let user_messages = count_user_messages(&request.messages);
        if user_messages <= config.first_turn_max_user_messages {
            return if self.draw(config.first_turn_opus_probability) {
                (
                    Tier::Opus,
                    format!("first_turn({} user msgs)", user_messages),
                    1,
                )
            } else {
                (
                    Tier::Sonnet,
                    format!("first_turn_sonnet({} user msgs)", user_messages),
                    1,
                )
            };
        }

        // 2: force-Opus keywords (case-sensitive substring match)
        if let Some(kw) = config
            .force_opus_keywords
            .iter()
            .find(|kw| last_user.contains(kw.as_str()))
        {
            return (Tier::Opus, format!("keyword_opus[{}]", kw), 2);
        }

        // 3: force-Sonnet keywords
        if let Some(kw) = config
            .force_sonnet_keywords
            .iter()
            .find(|kw| last_user.contains(kw.as_str()))
        {
            return (Tier::Sonnet, format!("keyword_sonnet[{}]", kw), 3);
        }

        // 4: execution phase, the history is dominated by tool traffic
        let tool_calls = count_tool_calls(&request.messages);
        if tool_calls >= config.execution_phase_tool_calls {
            return if self.draw(config.execution_phase_sonnet_probability) {
                (
                    Tier::Sonnet,
                    format!("execution_phase({} tool calls)", tool_calls),
                    4,
                )
            } else {
                (
                    Tier::Opus,
                    format!("execution_phase_opus({} tool calls)", tool_calls),
                    4,
                )
            };
        }

        // 5: baseline probability keeps a floor of Opus traffic
        if self.draw(config.base_opus_probability) {
            (Tier::Opus, "baseline_opus".to_string(), 5)
        } else {
            (Tier::Sonnet, "baseline_sonnet".to_string(), 5)
        }
    }

    pub fn route(&self, request: &ChatRequest, force_header: Option<&str>) -> RoutingDecision {
        if !self.config.enabled {
            return RoutingDecision {
                model: request.model.clone(),
                reason: "routing_disabled".to_string(),
                priority: 0,
            };
        }

        let (tier, reason, priority) = self.decide(request, force_header);
        let model = match tier {
            Tier::Opus => {
                self.counters.opus.fetch_add(1, Ordering::Relaxed);
                self.config.opus_model.clone()
            }
            Tier::Sonnet => {
                self.counters.sonnet.fetch_add(1, Ordering::Relaxed);
                self.config.sonnet_model.clone()
            }
        };

        if let Ok(mut reasons) = self.reasons.lock() {
            *reasons.entry(reason.clone()).or_insert(0) += 1;
        }
        if self.config.log_routing_decision {
            tracing::info!(
                "Routing: {} -> {} (reason: {}, priority: {})",
                request.model,
                model,
                reason,
                priority
            );
        }

        RoutingDecision {
            model,
            reason,
            priority,
        }
    }

    pub fn stats(&self) -> serde_json::Value {
        let opus = self.counters.opus.load(Ordering::Relaxed);
        let sonnet = self.counters.sonnet.load(Ordering::Relaxed);
        let total = opus + sonnet;
        let reasons = self
            .reasons
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default();
        json!({
            "opus_requests": opus,
            "sonnet_requests": sonnet,
            "total_requests": total,
            "opus_ratio": if total > 0 { opus as f64 / total as f64 } else { 0.0 },
            "routing_reasons": reasons,
        })
    }

    pub fn reset_stats(&self) {
        self.counters.opus.store(0, Ordering::Relaxed);
        self.counters.sonnet.store(0, Ordering::Relaxed);
        if let Ok(mut reasons) = self.reasons.lock() {
            reasons.clear();
        }
    }
}
