use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::SummaryCacheConfig;

#[derive(Debug, Clone)]
pub struct SummaryEntry {
    pub summary: String,
    pub snapshot_messages: usize,
    pub snapshot_chars: usize,
    updated_at: Instant,
    last_used: Instant,
}

impl SummaryEntry {
    fn new(summary: String, snapshot_messages: usize, snapshot_chars: usize) -> Self {
        let now = Instant::now();
        Self {
            summary,
            snapshot_messages,
            snapshot_chars,
            updated_at: now,
            last_used: now,
        }
    }

    pub fn age(&self) -> Duration {
        self.updated_at.elapsed()
    }
}

#[derive(Debug, PartialEq)]
pub enum CacheLookup {
    /// Fresh enough, use the cached summary as-is.
    Hit(String),
    /// Entry exists but the history moved past the delta thresholds.
    Stale,
    Miss,
}

// Per-session summary memoization. A single lock guards the map; every
// operation is a short critical section.
pub struct SummaryCache {
    entries: Mutex<HashMap<String, SummaryEntry>>,
    config: SummaryCacheConfig,
}

impl SummaryCache {
    pub fn new(config: SummaryCacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn max_age(&self) -> Duration {
        Duration::from_secs(self.config.max_age)
    }

    /// Consults the cache for `key` against the current old-history snapshot.
    pub fn lookup(&self, key: &str, messages: usize, chars: usize) -> CacheLookup {
        if !self.config.enabled {
            return CacheLookup::Miss;
        }
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(_) => return CacheLookup::Miss,
        };
        let Some(entry) = entries.get_mut(key) else {
            return CacheLookup::Miss;
        };
        if entry.age() > self.max_age() {
            entries.remove(key);
            tracing::debug!("[SummaryCache] {} -> EXPIRED", key);
            return CacheLookup::Miss;
        }
        let delta_messages = messages.saturating_sub(entry.snapshot_messages);
        let delta_chars = chars.saturating_sub(entry.snapshot_chars);
        if delta_messages >= self.config.min_delta_messages
            || delta_chars >= self.config.min_delta_chars
        {
            tracing::debug!(
                "[SummaryCache] {} -> STALE (Δmsg={}, Δchars={})",
                key,
                delta_messages,
                delta_chars
            );
            return CacheLookup::Stale;
        }
        entry.last_used = Instant::now();
        tracing::debug!("[SummaryCache] {} -> HIT", key);
        CacheLookup::Hit(entry.summary.clone())
    }

    /// Stores a summary if the acceptance law allows it: the slot is empty,
    /// the history delta crossed a threshold, or the prior entry aged out.
    /// Returns whether the write was accepted.
    pub fn store(&self, key: &str, summary: String, messages: usize, chars: usize) -> bool {
        if !self.config.enabled {
            return false;
        }
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };

        let accepted = match entries.get(key) {
            None => true,
            Some(prior) => {
                let delta_messages = messages.saturating_sub(prior.snapshot_messages);
                let delta_chars = chars.saturating_sub(prior.snapshot_chars);
                delta_messages >= self.config.min_delta_messages
                    || delta_chars >= self.config.min_delta_chars
                    || prior.age() >= self.max_age()
            }
        };

        if !accepted {
            tracing::debug!("[SummaryCache] {} -> write rejected (below deltas)", key);
            return false;
        }

        entries.insert(key.to_string(), SummaryEntry::new(summary, messages, chars));

        if entries.len() > self.config.max_entries {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
                tracing::debug!(
                    "[SummaryCache] evicted LRU entry {} (cap {})",
                    oldest,
                    self.config.max_entries
                );
            }
        }
        true
    }

    /// Message count recorded with the live entry for `key`, if any.
    pub fn snapshot_messages(&self, key: &str) -> Option<usize> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(key)?;
        if entry.age() > self.max_age() {
            return None;
        }
        Some(entry.snapshot_messages)
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|mut e| e.remove(key).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(min_msgs: usize, min_chars: usize, max_age: u64, cap: usize) -> SummaryCache {
        SummaryCache::new(SummaryCacheConfig {
            enabled: true,
            min_delta_messages: min_msgs,
            min_delta_chars: min_chars,
            max_age,
            max_entries: cap,
        })
    }

    #[test]
    fn empty_slot_write_is_accepted() {
        let cache = cache(3, 4000, 180, 16);
        assert!(cache.store("sid-a", "summary".to_string(), 10, 5000));
        assert_eq!(
            cache.lookup("sid-a", 10, 5000),
            CacheLookup::Hit("summary".to_string())
        );
    }

    #[test]
    fn write_below_deltas_is_rejected() {
        let cache = cache(3, 4000, 180, 16);
        assert!(cache.store("sid-a", "v1".to_string(), 10, 5000));
        assert!(!cache.store("sid-a", "v2".to_string(), 11, 5100));
        assert_eq!(
            cache.lookup("sid-a", 11, 5100),
            CacheLookup::Hit("v1".to_string())
        );
    }

    #[test]
    fn write_crossing_message_delta_is_accepted() {
        let cache = cache(3, 4000, 180, 16);
        cache.store("sid-a", "v1".to_string(), 10, 5000);
        assert!(cache.store("sid-a", "v2".to_string(), 13, 5100));
        assert_eq!(
            cache.lookup("sid-a", 13, 5100),
            CacheLookup::Hit("v2".to_string())
        );
    }

    #[test]
    fn lookup_reports_stale_on_char_delta() {
        let cache = cache(3, 4000, 180, 16);
        cache.store("sid-a", "v1".to_string(), 10, 5000);
        assert_eq!(cache.lookup("sid-a", 10, 9500), CacheLookup::Stale);
    }

    #[test]
    fn expired_entries_never_returned() {
        let cache = cache(3, 4000, 0, 16);
        cache.store("sid-a", "v1".to_string(), 10, 5000);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(cache.lookup("sid-a", 10, 5000), CacheLookup::Miss);
    }

    #[test]
    fn lru_eviction_respects_cap() {
        let cache = cache(1, 1, 180, 2);
        cache.store("a", "1".to_string(), 1, 1);
        cache.store("b", "2".to_string(), 1, 1);
        // touch `a` so `b` becomes the LRU victim
        let _ = cache.lookup("a", 1, 1);
        cache.store("c", "3".to_string(), 1, 1);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup("b", 1, 1), CacheLookup::Miss);
        assert!(matches!(cache.lookup("a", 1, 1), CacheLookup::Hit(_)));
    }

    #[test]
    fn disabled_cache_is_inert() {
        let cache = SummaryCache::new(SummaryCacheConfig {
            enabled: false,
            ..SummaryCacheConfig::default()
        });
        assert!(!cache.store("a", "1".to_string(), 1, 1));
        assert_eq!(cache.lookup("a", 1, 1), CacheLookup::Miss);
    }
}
