//! # Evaluation result cache
//!
//! Bounded LRU with TTL and a flag reverse index.
//!
//! Keys are SHA-256 hashes over `(flag key, canonicalized context,
//! environment)`, so raw context attributes never sit in memory and an
//! identical context always maps to the same entry regardless of JSON
//! key order. The reverse index maps a flag key to the cache keys it
//! produced, making [`EvaluationCache::invalidate_flag`] proportional
//! to that flag's entries instead of the whole cache. Bootstrap
//! responses are cached under the reserved [`BOOTSTRAP_KEY`] and are
//! invalidated on any flag mutation, since they may contain any flag.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use featuregate_engine::EvaluationContext;
use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::CacheSettings;

/// Pseudo flag key under which bootstrap responses are cached.
pub const BOOTSTRAP_KEY: &str = "*bootstrap*";

/// Cache usage counters exposed via `/health` and `stats()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

struct CacheEntry {
    payload: Value,
    flag_key: String,
    expires_at: Instant,
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,
    by_flag: HashMap<String, HashSet<String>>,
}

impl CacheState {
    fn unindex(&mut self, flag_key: &str, cache_key: &str) {
        if let Some(keys) = self.by_flag.get_mut(flag_key) {
            keys.remove(cache_key);
            if keys.is_empty() {
                self.by_flag.remove(flag_key);
            }
        }
    }
}

pub struct EvaluationCache {
    enabled: bool,
    ttl: Duration,
    max_size: usize,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EvaluationCache {
    pub fn new(settings: &CacheSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.max_size.max(1)).expect("max(1) is non-zero");
        Self {
            enabled: settings.enabled,
            ttl: settings.ttl,
            max_size: settings.max_size,
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                by_flag: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Derives the hashed cache key for a `(flag, context, environment)`
    /// triple. Context serialization is canonicalized so attribute
    /// insertion order cannot split the cache.
    pub fn cache_key(
        flag_key: &str,
        context: &EvaluationContext,
        environment: Option<&str>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(flag_key.as_bytes());
        hasher.update(b"|");
        let context_json = serde_json::to_value(context).unwrap_or(Value::Null);
        hasher.update(canonicalize(&context_json).as_bytes());
        hasher.update(b"|");
        hasher.update(environment.unwrap_or_default().as_bytes());
        hex(&hasher.finalize())
    }

    pub fn get(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
        environment: Option<&str>,
    ) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        let cache_key = Self::cache_key(flag_key, context, environment);
        let mut state = self.state.lock().ok()?;
        match state.entries.get(&cache_key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.payload.clone())
            }
            Some(_) => {
                if let Some(stale) = state.entries.pop(&cache_key) {
                    state.unindex(&stale.flag_key, &cache_key);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
        environment: Option<&str>,
        payload: Value,
        ttl: Option<Duration>,
    ) {
        if !self.enabled {
            return;
        }
        let cache_key = Self::cache_key(flag_key, context, environment);
        let entry = CacheEntry {
            payload,
            flag_key: flag_key.to_string(),
            expires_at: Instant::now() + ttl.unwrap_or(self.ttl),
        };
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some((evicted_key, evicted)) = state.entries.push(cache_key.clone(), entry) {
            // push returns the displaced LRU entry (or the previous
            // value under the same key); either way its index slot is
            // stale now
            if evicted_key != cache_key {
                state.unindex(&evicted.flag_key, &evicted_key);
            }
        }
        state
            .by_flag
            .entry(flag_key.to_string())
            .or_default()
            .insert(cache_key);
    }

    pub fn delete(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
        environment: Option<&str>,
    ) {
        let cache_key = Self::cache_key(flag_key, context, environment);
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(entry) = state.entries.pop(&cache_key) {
            state.unindex(&entry.flag_key, &cache_key);
        }
    }

    /// Drops every cached result derived from `flag_key`, plus all
    /// bootstrap entries (which may embed the flag).
    pub fn invalidate_flag(&self, flag_key: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        for key in [flag_key, BOOTSTRAP_KEY] {
            if let Some(cache_keys) = state.by_flag.remove(key) {
                for cache_key in cache_keys {
                    state.entries.pop(&cache_key);
                }
            }
        }
    }

    /// Removes expired entries.
    pub fn cleanup(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let now = Instant::now();
        let expired: Vec<(String, String)> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, entry)| (key.clone(), entry.flag_key.clone()))
            .collect();
        for (cache_key, flag_key) in expired {
            state.entries.pop(&cache_key);
            state.unindex(&flag_key, &cache_key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let size = self
            .state
            .lock()
            .map(|state| state.entries.len())
            .unwrap_or(0);
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size,
            max_size: self.max_size,
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

/// Deterministic JSON serialization: object keys sorted recursively.
pub fn canonicalize(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
