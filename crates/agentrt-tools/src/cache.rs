// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-result cache: short-lived memoization of repeated tool calls.
//!
//! Keyed on the tool name and its JSON arguments so that the exact same call
//! made twice in a row (a common pattern when a model re-checks a file it
//! just read) is served without re-invoking the tool. Entries expire after a
//! TTL and the cache evicts the oldest entry by creation time once full —
//! not access time, so a single hot key cannot pin out everything else.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Tunables for [`ToolResultCache`].
#[derive(Debug, Clone, Copy)]
pub struct ToolResultCacheConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for ToolResultCacheConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(30), capacity: 100 }
    }
}

struct Entry {
    output: String,
    success: bool,
    created_at: Instant,
}

/// Sharded-by-key (in practice a single striped map is enough at this scale)
/// cache of tool results, keyed by `sha256(name || 0x00 || json(args))`
/// truncated to its first 16 hex characters.
pub struct ToolResultCache {
    config: ToolResultCacheConfig,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ToolResultCache {
    pub fn new(config: ToolResultCacheConfig) -> Self {
        Self { config, entries: Mutex::new(HashMap::new()) }
    }

    /// Compute the cache key for a `(name, args)` pair.
    pub fn key(name: &str, args: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(args.to_string().as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..8]) // 8 bytes -> 16 hex chars
    }

    /// Look up a cached result. Returns `None` on a miss or an expired entry
    /// (the expired entry is removed eagerly).
    pub fn get(&self, name: &str, args: &Value) -> Option<(String, bool)> {
        let key = Self::key(name, args);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(&key) {
            Some(e) if e.created_at.elapsed() <= self.config.ttl => {
                Some((e.output.clone(), e.success))
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Store a result (success or failure — both are cached per spec).
    pub fn put(&self, name: &str, args: &Value, output: String, success: bool) {
        let key = Self::key(name, args);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.config.capacity && !entries.contains_key(&key) {
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest_key);
            }
        }
        entries.insert(key, Entry { output, success, created_at: Instant::now() });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ToolResultCache {
    fn default() -> Self {
        Self::new(ToolResultCacheConfig::default())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn miss_on_empty_cache() {
        let c = ToolResultCache::default();
        assert!(c.get("read_file", &json!({"path": "a"})).is_none());
    }

    #[test]
    fn put_then_get_returns_same_value() {
        let c = ToolResultCache::default();
        c.put("read_file", &json!({"path": "a"}), "contents".into(), true);
        let (out, ok) = c.get("read_file", &json!({"path": "a"})).unwrap();
        assert_eq!(out, "contents");
        assert!(ok);
    }

    #[test]
    fn different_args_are_different_keys() {
        let c = ToolResultCache::default();
        c.put("read_file", &json!({"path": "a"}), "A".into(), true);
        assert!(c.get("read_file", &json!({"path": "b"})).is_none());
    }

    #[test]
    fn failures_are_cached_too() {
        let c = ToolResultCache::default();
        c.put("shell", &json!({"cmd": "false"}), "exit 1".into(), false);
        let (out, ok) = c.get("shell", &json!({"cmd": "false"})).unwrap();
        assert_eq!(out, "exit 1");
        assert!(!ok);
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let c = ToolResultCache::new(ToolResultCacheConfig {
            ttl: Duration::from_millis(5),
            capacity: 10,
        });
        c.put("t", &json!({}), "v".into(), true);
        std::thread::sleep(Duration::from_millis(20));
        assert!(c.get("t", &json!({})).is_none());
    }

    #[test]
    fn eviction_prefers_oldest_created_entry() {
        let c = ToolResultCache::new(ToolResultCacheConfig {
            ttl: Duration::from_secs(30),
            capacity: 2,
        });
        c.put("a", &json!({}), "1".into(), true);
        std::thread::sleep(Duration::from_millis(5));
        c.put("b", &json!({}), "2".into(), true);
        std::thread::sleep(Duration::from_millis(5));
        // Cache full; inserting a third key must evict "a" (oldest), not "b".
        c.put("c", &json!({}), "3".into(), true);
        assert!(c.get("a", &json!({})).is_none());
        assert!(c.get("b", &json!({})).is_some());
        assert!(c.get("c", &json!({})).is_some());
    }

    #[test]
    fn key_is_stable_for_same_input() {
        let k1 = ToolResultCache::key("x", &json!({"a": 1}));
        let k2 = ToolResultCache::key("x", &json!({"a": 1}));
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 16);
    }
}
