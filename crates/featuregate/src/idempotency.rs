//! Bounded TTL map behind the event idempotency check.
//!
//! The engine only depends on the `seen(user, key)` question; shared
//! deployments should back this with an external store, this in-process
//! map is the single-node default.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_MAX_ENTRIES: usize = 10_000;

pub struct IdempotencyStore {
    entries: Mutex<HashMap<(String, String), Instant>>,
    ttl: Duration,
    max_entries: usize,
}

impl IdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Returns true when `(principal, key)` was already submitted
    /// within the TTL; otherwise remembers it and returns false.
    pub fn seen(&self, principal: &str, key: &str) -> bool {
        let now = Instant::now();
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let map_key = (principal.to_string(), key.to_string());
        if let Some(at) = entries.get(&map_key) {
            if now.duration_since(*at) < self.ttl {
                return true;
            }
        }
        if entries.len() >= self.max_entries {
            entries.retain(|_, at| now.duration_since(*at) < self.ttl);
            // still saturated after pruning: forget oldest entries
            if entries.len() >= self.max_entries {
                let mut by_age: Vec<((String, String), Instant)> =
                    entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
                by_age.sort_by_key(|(_, at)| *at);
                for (key, _) in by_age.iter().take(entries.len() - self.max_entries + 1) {
                    entries.remove(key);
                }
            }
        }
        entries.insert(map_key, now);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_seen_is_false_then_true() {
        let store = IdempotencyStore::new(Duration::from_secs(60));
        assert!(!store.seen("u1", "evt-1"));
        assert!(store.seen("u1", "evt-1"));
        // scoped per principal
        assert!(!store.seen("u2", "evt-1"));
    }

    #[test]
    fn test_expired_keys_are_reusable() {
        let store = IdempotencyStore::new(Duration::from_millis(0));
        assert!(!store.seen("u1", "evt-1"));
        assert!(!store.seen("u1", "evt-1"));
    }

    #[test]
    fn test_bounded_size() {
        let store = IdempotencyStore::new(Duration::from_secs(60)).with_max_entries(4);
        for i in 0..32 {
            store.seen("u1", &format!("evt-{i}"));
        }
        assert!(store.entries.lock().unwrap().len() <= 4);
    }
}
