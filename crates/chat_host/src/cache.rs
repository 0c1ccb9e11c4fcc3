//! Memoized non-streaming replies, so asking the same thing twice does not
//! hit the backend again.

use lru::LruCache;
use serde_json::json;
use shared::agent_api::ChatMessage;
use shared::config::CacheConfig;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry {
    content: String,
    inserted: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.inserted) >= ttl
    }
}

/// Least recently used replies are evicted first once `capacity` is reached.
#[derive(Debug)]
pub struct ResponseCache {
    entries: LruCache<String, CacheEntry>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration, capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// `None` when caching is disabled or `max_entries` is 0.
    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let capacity = NonZeroUsize::new(config.max_entries)?;
        Some(Self::new(config.ttl(), capacity))
    }

    /// Everything that influences the reply goes into the key.
    pub fn key(messages: &[ChatMessage], model: &str, temperature: f64, max_tokens: u32) -> String {
        json!({
            "messages": messages,
            "model": model,
            "temperature": temperature,
            "max_tokens": max_tokens,
        })
        .to_string()
    }

    pub fn get(&mut self, key: &str, now: Instant) -> Option<String> {
        let entry = self.entries.get(key)?;
        if !entry.is_expired(now, self.ttl) {
            return Some(entry.content.clone());
        }
        self.entries.pop(key);
        None
    }

    pub fn insert(&mut self, key: String, content: String, now: Instant) {
        self.entries.put(
            key,
            CacheEntry {
                content,
                inserted: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl_secs: u64, capacity: usize) -> ResponseCache {
        ResponseCache::new(
            Duration::from_secs(ttl_secs),
            NonZeroUsize::new(capacity).unwrap(),
        )
    }

    fn key(text: &str) -> String {
        ResponseCache::key(&[ChatMessage::user(text)], "qwen2.5:3b", 0.7, 512)
    }

    #[test]
    fn test_key_covers_parameters() {
        let messages = [ChatMessage::user("hi")];
        let base = ResponseCache::key(&messages, "m", 0.7, 512);
        assert_eq!(base, ResponseCache::key(&messages, "m", 0.7, 512));
        assert_ne!(base, ResponseCache::key(&messages, "other", 0.7, 512));
        assert_ne!(base, ResponseCache::key(&messages, "m", 0.2, 512));
        assert_ne!(base, ResponseCache::key(&messages, "m", 0.7, 64));
    }

    #[test]
    fn test_entries_expire() {
        let mut cache = cache(60, 10);
        let now = Instant::now();
        cache.insert(key("a"), "reply".into(), now);

        assert_eq!(cache.get(&key("a"), now + Duration::from_secs(59)).as_deref(), Some("reply"));
        assert_eq!(cache.get(&key("a"), now + Duration::from_secs(60)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_oldest_entry_evicted_at_capacity() {
        let mut cache = cache(60, 2);
        let now = Instant::now();
        cache.insert(key("a"), "1".into(), now);
        cache.insert(key("b"), "2".into(), now + Duration::from_secs(1));
        cache.insert(key("c"), "3".into(), now + Duration::from_secs(2));

        let later = now + Duration::from_secs(3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key("a"), later), None);
        assert_eq!(cache.get(&key("c"), later).as_deref(), Some("3"));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let mut cache = cache(60, 2);
        let now = Instant::now();
        cache.insert(key("a"), "1".into(), now);
        cache.insert(key("b"), "2".into(), now);
        cache.insert(key("a"), "1b".into(), now);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key("b"), now).as_deref(), Some("2"));
    }

    #[test]
    fn test_disabled_config() {
        let config = CacheConfig {
            enabled: false,
            ttl: 3600,
            max_entries: 100,
        };
        assert!(ResponseCache::from_config(&config).is_none());

        let zero = CacheConfig {
            enabled: true,
            ttl: 3600,
            max_entries: 0,
        };
        assert!(ResponseCache::from_config(&zero).is_none());
    }

    #[test]
    fn test_lookup_keeps_entry_alive_under_pressure() {
        let mut cache = cache(60, 2);
        let now = Instant::now();
        cache.insert(key("a"), "1".into(), now);
        cache.insert(key("b"), "2".into(), now);
        assert_eq!(cache.get(&key("a"), now).as_deref(), Some("1"));

        cache.insert(key("c"), "3".into(), now);
        assert_eq!(cache.get(&key("b"), now), None);
        assert_eq!(cache.get(&key("a"), now).as_deref(), Some("1"));
        assert_eq!(cache.get(&key("c"), now).as_deref(), Some("3"));
    }
}
