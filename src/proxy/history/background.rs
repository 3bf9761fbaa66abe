use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tracing::{debug, info, warn};

use crate::config::AsyncSummaryConfig;
use crate::proxy::chat::{total_chars, Message};
use crate::proxy::history::{SummaryCache, SummaryFn};

// Fire-and-forget summary generation so the first over-budget request in a
// session is never blocked on an upstream summarization round-trip. The
// in-flight set deduplicates refreshes per cache key; the pending counter
// bounds how much work a burst of sessions can queue.
pub struct BackgroundSummarizer {
    config: AsyncSummaryConfig,
    cache: Arc<SummaryCache>,
    pending: AtomicUsize,
    in_flight: DashSet<String>,
}

impl BackgroundSummarizer {
    pub fn new(config: AsyncSummaryConfig, cache: Arc<SummaryCache>) -> Self {
        Self {
            config,
            cache,
            pending: AtomicUsize::new(0),
            in_flight: DashSet::new(),
        }
    }

    pub fn fast_first_enabled(&self) -> bool {
        self.config.enabled && self.config.fast_first_request
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Queues a summary for `key`. Returns false when the task was dropped
    /// (disabled, duplicate, or the pending pool is full).
    pub fn schedule(
        self: &Arc<Self>,
        key: String,
        older: Vec<Message>,
        prompt: String,
        summary_fn: SummaryFn,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        if self.pending.load(Ordering::Relaxed) >= self.config.max_pending_tasks {
            warn!(
                "[W-SUMMARY-POOL-FULL] dropping_background_summary_task: {} pending",
                self.pending.load(Ordering::Relaxed)
            );
            return false;
        }
        // refresh throttle: an existing entry is only regenerated once the
        // conversation has grown by update_interval_messages
        if let Some(snapshot) = self.cache.snapshot_messages(&key) {
            let delta = older.len().saturating_sub(snapshot);
            if delta < self.config.update_interval_messages {
                debug!(
                    "[BackgroundSummarizer] {} refresh skipped (Δ{} messages)",
                    key, delta
                );
                return false;
            }
        }
        if !self.in_flight.insert(key.clone()) {
            debug!("[BackgroundSummarizer] {} already in flight", key);
            return false;
        }

        self.pending.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        let timeout = Duration::from_secs(self.config.task_timeout);
        tokio::spawn(async move {
            let snapshot_messages = older.len();
            let snapshot_chars = total_chars(&older);
            match tokio::time::timeout(timeout, summary_fn(prompt)).await {
                Ok(Ok(summary)) => {
                    if this
                        .cache
                        .store(&key, summary, snapshot_messages, snapshot_chars)
                    {
                        info!("[BackgroundSummarizer] summary cached for {}", key);
                    }
                }
                Ok(Err(e)) => {
                    warn!(
                        "[W-SUMMARY-BACKGROUND-FAILED] background_summary_failed for {}: {}",
                        key, e
                    );
                }
                Err(_) => {
                    warn!(
                        "[W-SUMMARY-TIMEOUT] background_summary_timed_out for {} after {:?}",
                        key, timeout
                    );
                }
            }
            this.in_flight.remove(&key);
            this.pending.fetch_sub(1, Ordering::Relaxed);
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SummaryCacheConfig;
    use crate::proxy::history::CacheLookup;

    fn summarizer(config: AsyncSummaryConfig) -> (Arc<BackgroundSummarizer>, Arc<SummaryCache>) {
        let cache = Arc::new(SummaryCache::new(SummaryCacheConfig::default()));
        (
            Arc::new(BackgroundSummarizer::new(config, cache.clone())),
            cache,
        )
    }

    fn instant_summary() -> SummaryFn {
        Arc::new(|_prompt| Box::pin(async { Ok("background summary".to_string()) }))
    }

    #[tokio::test]
    async fn scheduled_task_populates_cache() {
        let (bg, cache) = summarizer(AsyncSummaryConfig::default());
        let older = vec![Message::user("a long conversation happened here")];
        assert!(bg.schedule(
            "sid-bg:4".to_string(),
            older,
            "prompt".to_string(),
            instant_summary()
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            cache.lookup("sid-bg:4", 1, 33),
            CacheLookup::Hit(_)
        ));
        assert_eq!(bg.pending_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_keys_are_deduplicated() {
        let (bg, _cache) = summarizer(AsyncSummaryConfig::default());
        let slow: SummaryFn = Arc::new(|_prompt| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok("slow".to_string())
            })
        });
        let older = vec![Message::user("content")];
        assert!(bg.schedule("sid-dup:4".to_string(), older.clone(), "p".to_string(), slow.clone()));
        assert!(!bg.schedule("sid-dup:4".to_string(), older, "p".to_string(), slow));
    }

    #[tokio::test]
    async fn pool_cap_drops_excess_tasks() {
        let (bg, _cache) = summarizer(AsyncSummaryConfig {
            max_pending_tasks: 1,
            ..AsyncSummaryConfig::default()
        });
        let slow: SummaryFn = Arc::new(|_prompt| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok("slow".to_string())
            })
        });
        let older = vec![Message::user("content")];
        assert!(bg.schedule("sid-one:4".to_string(), older.clone(), "p".to_string(), slow.clone()));
        assert!(!bg.schedule("sid-two:4".to_string(), older, "p".to_string(), slow));
    }

    #[tokio::test]
    async fn refresh_throttled_below_update_interval() {
        let (bg, cache) = summarizer(AsyncSummaryConfig {
            update_interval_messages: 5,
            ..AsyncSummaryConfig::default()
        });
        cache.store("sid-th:4", "old".to_string(), 10, 500);
        // only two messages of growth since the snapshot
        let older: Vec<Message> = (0..12).map(|i| Message::user(format!("m{}", i))).collect();
        assert!(!bg.schedule(
            "sid-th:4".to_string(),
            older,
            "p".to_string(),
            instant_summary()
        ));
    }

    #[tokio::test]
    async fn disabled_config_schedules_nothing() {
        let (bg, _cache) = summarizer(AsyncSummaryConfig {
            enabled: false,
            ..AsyncSummaryConfig::default()
        });
        assert!(!bg.schedule(
            "sid-off:4".to_string(),
            vec![Message::user("content")],
            "p".to_string(),
            instant_summary()
        ));
    }
}
