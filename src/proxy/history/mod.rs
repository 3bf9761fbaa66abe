pub mod background;
pub mod cache;

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::config::{HistoryConfig, TruncateStrategy};
use crate::constants;
use crate::error::AppResult;
use crate::proxy::chat::{total_chars, Message};

pub use background::BackgroundSummarizer;
pub use cache::{CacheLookup, SummaryCache, SummaryEntry};

/// Capability the engine uses to produce a summary. The orchestrator wires a
/// concrete upstream-backed closure in; the engine never sees the client type.
pub type SummaryFn = Arc<dyn Fn(String) -> BoxFuture<'static, AppResult<String>> + Send + Sync>;

pub struct HistoryManager {
    config: HistoryConfig,
    cache: Arc<SummaryCache>,
    background: Option<Arc<BackgroundSummarizer>>,
    session_key: Option<String>,
    truncated: bool,
    truncate_info: String,
}

impl HistoryManager {
    pub fn new(config: HistoryConfig, cache: Arc<SummaryCache>) -> Self {
        Self {
            config,
            cache,
            background: None,
            session_key: None,
            truncated: false,
            truncate_info: String::new(),
        }
    }

    pub fn with_background(mut self, background: Arc<BackgroundSummarizer>) -> Self {
        self.background = Some(background);
        self
    }

    pub fn with_session_key(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    pub fn truncate_info(&self) -> &str {
        &self.truncate_info
    }

    pub fn reset(&mut self) {
        self.truncated = false;
        self.truncate_info.clear();
    }

    fn mark(&mut self, info: String) {
        self.truncated = true;
        info!("{}", info);
        self.truncate_info = info;
    }

    fn cache_key(&self, target: usize) -> Option<String> {
        self.session_key.as_ref().map(|k| format!("{}:{}", k, target))
    }

    // ==================== predicates & estimates ====================

    pub fn estimate_history_size(&self, history: &[Message]) -> (usize, usize) {
        (history.len(), total_chars(history))
    }

    pub fn estimate_request_chars(
        &self,
        history: &[Message],
        user_content: &str,
    ) -> (usize, usize, usize) {
        let history_chars = total_chars(history);
        let user_chars = user_content.len();
        (history_chars, user_chars, history_chars + user_chars)
    }

    pub fn should_pre_truncate(&self, history: &[Message], user_content: &str) -> bool {
        if !self.config.has(TruncateStrategy::PreEstimate) {
            return false;
        }
        total_chars(history) + user_content.len() > self.config.estimate_threshold
    }

    pub fn should_summarize(&self, history: &[Message]) -> bool {
        if !self.config.has(TruncateStrategy::SmartSummary) {
            return false;
        }
        total_chars(history) > self.config.summary_threshold
            && history.len() > self.config.summary_keep_recent
    }

    // ==================== truncation primitives ====================

    /// Keeps the most recent `max_count` messages. A leading assistant turn
    /// left by the cut is dropped so user/assistant alternation survives.
    fn truncate_by_count(&mut self, history: Vec<Message>, max_count: usize) -> Vec<Message> {
        if history.len() <= max_count {
            return history;
        }
        let original = history.len();
        let mut kept: Vec<Message> = history
            .into_iter()
            .skip(original - max_count)
            .collect();
        if kept.first().map(|m| m.role == "assistant").unwrap_or(false) {
            kept.remove(0);
        }
        self.mark(format!(
            "Truncated by count: {} -> {} messages",
            original,
            kept.len()
        ));
        kept
    }

    /// Drops the oldest user+assistant pair until the history fits the char
    /// budget. Pair-wise removal keeps the alternation invariant intact.
    fn truncate_pairs_to_chars(&mut self, mut history: Vec<Message>, max_chars: usize) -> Vec<Message> {
        let original_count = history.len();
        let original_chars = total_chars(&history);
        if original_chars <= max_chars {
            return history;
        }

        while total_chars(&history) > max_chars && history.len() > 1 {
            let drop = if history.len() >= 2
                && history[0].role == "user"
                && history[1].role == "assistant"
            {
                2
            } else {
                1
            };
            history.drain(..drop);
        }

        self.mark(format!(
            "Truncated by chars: {} -> {} messages ({} -> {} chars)",
            original_count,
            history.len(),
            original_chars,
            total_chars(&history)
        ));
        history
    }

    // ==================== summarization ====================

    fn split_for_summary(&self, history: &[Message]) -> usize {
        let mut keep = self.config.summary_keep_recent.min(history.len());
        // prefer a split where the retained tail starts with a user turn
        while keep < history.len() && history[history.len() - keep].role != "user" {
            keep += 1;
        }
        if keep >= history.len() {
            self.config.summary_keep_recent.min(history.len())
        } else {
            keep
        }
    }

    pub fn build_summary_prompt(&self, older: &[Message]) -> String {
        let mut transcript = String::new();
        for msg in older {
            transcript.push_str(&msg.role);
            transcript.push_str(": ");
            transcript.push_str(&msg.text());
            transcript.push('\n');
        }
        if transcript.len() > 10_000 {
            transcript.truncate(floor_boundary(&transcript, 10_000));
            transcript.push_str("\n...(truncated)");
        }
        format!(
            "Summarize the key information from this conversation history:\n\
             1. The user's goals and requirements\n\
             2. Work that has been completed\n\
             3. The current state and context\n\
             4. Key files, identifiers and commands mentioned\n\n\
             Conversation history:\n{}\n\n\
             Keep the summary under {} characters:",
            transcript, self.config.summary_max_chars
        )
    }

    fn build_summary_history(&self, summary: &str, recent: Vec<Message>) -> Vec<Message> {
        let mut result = Vec::with_capacity(recent.len() + 2);
        result.push(Message::user(format!(
            "{}\n{}\n\n{}",
            constants::SUMMARY_USER_PREFIX,
            summary,
            constants::SUMMARY_USER_SUFFIX
        )));
        result.push(Message::assistant(constants::SUMMARY_ACK));
        result.extend(recent);
        result
    }

    async fn generate_summary(
        &self,
        older: &[Message],
        summary_fn: &SummaryFn,
    ) -> Option<String> {
        if older.is_empty() {
            return None;
        }
        let prompt = self.build_summary_prompt(older);
        match summary_fn(prompt).await {
            Ok(mut summary) => {
                if summary.len() > self.config.summary_max_chars {
                    summary.truncate(floor_boundary(&summary, self.config.summary_max_chars));
                    summary.push_str("...");
                }
                Some(summary)
            }
            Err(e) => {
                warn!("[W-SUMMARY-FAILED] summary_generation_failed: {}", e);
                None
            }
        }
    }

    /// Summarize-or-truncate for an over-budget history. `target_keep` is the
    /// number of recent messages retained verbatim.
    async fn compress_with_summary(
        &mut self,
        history: Vec<Message>,
        target_keep: usize,
        summary_fn: Option<&SummaryFn>,
        label: &str,
    ) -> Vec<Message> {
        let keep = target_keep.min(history.len());
        let split = history.len() - keep;
        let older: Vec<Message> = history[..split].to_vec();
        let recent: Vec<Message> = history[split..].to_vec();
        let (old_count, old_chars) = (older.len(), total_chars(&older));
        let original = history.len();

        if let Some(key) = self.cache_key(keep) {
            match self.cache.lookup(&key, old_count, old_chars) {
                CacheLookup::Hit(cached) => {
                    let result = self.build_summary_history(&cached, recent);
                    self.mark(format!(
                        "{} (cached): {} -> {} messages",
                        label,
                        original,
                        result.len()
                    ));
                    return result;
                }
                CacheLookup::Stale | CacheLookup::Miss => {}
            }
        }

        // fast-first: answer with plain truncation now, let the summary land
        // in the cache for the next turn
        if let Some(background) = self.background.clone() {
            if background.fast_first_enabled() {
                if let (Some(summary_fn), Some(key)) = (summary_fn, self.cache_key(keep)) {
                    let scheduled = background.schedule(
                        key,
                        older.clone(),
                        self.build_summary_prompt(&older),
                        summary_fn.clone(),
                    );
                    let note = if scheduled {
                        "deferred to background"
                    } else {
                        "truncated while a summary is pending"
                    };
                    self.mark(format!(
                        "{} ({}): {} -> {} messages",
                        label,
                        note,
                        original,
                        recent.len()
                    ));
                    return recent;
                }
            }
        }

        if let Some(summary_fn) = summary_fn {
            if let Some(summary) = self.generate_summary(&older, summary_fn).await {
                if let Some(key) = self.cache_key(keep) {
                    self.cache.store(&key, summary.clone(), old_count, old_chars);
                }
                let summary_chars = summary.len();
                let result = self.build_summary_history(&summary, recent);
                self.mark(format!(
                    "{}: {} -> {} messages ({} chars of summary)",
                    label,
                    original,
                    result.len(),
                    summary_chars
                ));
                return result;
            }
        }

        // summarization unavailable or failed: plain truncation, never fail
        // the request over a summary
        self.mark(format!(
            "{} fell back to truncation: {} -> {} messages",
            label, original, recent.len()
        ));
        recent
    }

    // ==================== pre-processing ====================

    fn apply_sync_strategies(&mut self, mut history: Vec<Message>, user_content: &str) -> Vec<Message> {
        if self.config.has(TruncateStrategy::PreEstimate) {
            let projected = total_chars(&history) + user_content.len();
            if projected > self.config.estimate_threshold {
                let target = (self.config.estimate_threshold as f64 * 0.8) as usize;
                debug!(
                    "Pre-estimate fired: {} chars projected > {} threshold",
                    projected, self.config.estimate_threshold
                );
                history = self.truncate_pairs_to_chars(history, target);
            }
        }

        if self.config.has(TruncateStrategy::AutoTruncate) {
            if history.len() > self.config.max_messages {
                history = self.truncate_by_count(history, self.config.max_messages);
            }
            if total_chars(&history) > self.config.max_chars {
                history = self.truncate_pairs_to_chars(history, self.config.max_chars);
            }
        }

        history
    }

    /// Synchronous shaping: estimation and truncation only.
    pub fn pre_process(&mut self, history: Vec<Message>, user_content: &str) -> Vec<Message> {
        self.reset();
        if history.is_empty() {
            return history;
        }
        self.apply_sync_strategies(history, user_content)
    }

    /// Full shaping pipeline including summarization.
    pub async fn pre_process_async(
        &mut self,
        history: Vec<Message>,
        user_content: &str,
        summary_fn: Option<SummaryFn>,
    ) -> Vec<Message> {
        self.reset();
        if history.is_empty() {
            return history;
        }

        let mut history = self.apply_sync_strategies(history, user_content);

        if self.config.has(TruncateStrategy::SmartSummary)
            && total_chars(&history) > self.config.summary_threshold
            && history.len() > self.config.summary_keep_recent
        {
            let keep = self.split_for_summary(&history);
            history = self
                .compress_with_summary(history, keep, summary_fn.as_ref(), "Smart summary")
                .await;
        }

        history
    }

    // ==================== length-error recovery ====================

    /// Shrinks the retained tail by ~30% per attempt after an upstream
    /// length failure. Returns the reshaped history and whether another
    /// upstream attempt is worthwhile.
    pub async fn handle_length_error(
        &mut self,
        history: Vec<Message>,
        retry_count: usize,
        summary_fn: Option<SummaryFn>,
    ) -> (Vec<Message>, bool) {
        if !self.config.has(TruncateStrategy::ErrorRetry) {
            return (history, false);
        }
        if retry_count >= self.config.max_retries {
            return (history, false);
        }
        if history.is_empty() {
            return (history, false);
        }

        let factor = 1.0 - (retry_count as f64 * 0.3);
        let target = ((self.config.retry_max_messages as f64 * factor) as usize).max(5);
        if history.len() <= target {
            // nothing left to shave off, a retry would just fail again
            return (history, false);
        }

        self.reset();

        if self.config.has(TruncateStrategy::SmartSummary) && summary_fn.is_some() {
            let label = format!("Length-error summary (attempt {})", retry_count + 1);
            let result = self
                .compress_with_summary(history, target, summary_fn.as_ref(), &label)
                .await;
            return (result, true);
        }

        let result = self.truncate_by_count(history, target);
        (result, true)
    }
}

fn floor_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
