//! Per-account model-name rewriting.
//!
//! A mapping object maps family names or arbitrary substrings
//! (`opus`/`sonnet`/`haiku`/`claude-opus-4`/…) to provider-specific model
//! ids. Lookup is longest-key-first substring match; a miss falls back to
//! the `sonnet` mapping when present. The sorted key order per distinct
//! mapping object is cached in a bounded LRU.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde_json::{Map, Value};

const SORTED_KEYS_CACHE_SIZE: usize = 1000;
const DEFAULT_FAMILY: &str = "sonnet";

pub struct ModelMapper {
    sorted_keys: Mutex<LruCache<String, Vec<String>>>,
}

impl ModelMapper {
    pub fn new() -> Self {
        Self {
            sorted_keys: Mutex::new(LruCache::new(
                NonZeroUsize::new(SORTED_KEYS_CACHE_SIZE).expect("nonzero cache size"),
            )),
        }
    }

    /// Keys of `mappings` sorted longest first, stably by name within equal
    /// lengths. Cached per normalized mapping object.
    fn keys_longest_first(&self, mappings: &Map<String, Value>) -> Vec<String> {
        // String-normalized cache key: serde_json maps preserve insertion
        // order, so sort the key list itself before joining.
        let mut names: Vec<&str> = mappings.keys().map(String::as_str).collect();
        names.sort_unstable();
        let cache_key = names.join("\u{1}");

        let mut cache = self.sorted_keys.lock().expect("mapping cache poisoned");
        if let Some(hit) = cache.get(&cache_key) {
            return hit.clone();
        }
        let mut sorted: Vec<String> = mappings.keys().cloned().collect();
        sorted.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        cache.put(cache_key, sorted.clone());
        sorted
    }

    /// Rewrite `model` through the mapping object. Returns `None` when the
    /// object has nothing to say about this model.
    pub fn resolve(&self, mappings: &Map<String, Value>, model: &str) -> Option<String> {
        if mappings.is_empty() {
            return None;
        }
        for key in self.keys_longest_first(mappings) {
            if model.contains(key.as_str()) {
                return mappings.get(&key).and_then(|v| v.as_str()).map(String::from);
            }
        }
        // Unmatched models fall back to the sonnet-family mapping.
        mappings
            .get(DEFAULT_FAMILY)
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    pub fn cache_len(&self) -> usize {
        self.sorted_keys.lock().expect("mapping cache poisoned").len()
    }
}

impl Default for ModelMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mappings() -> Map<String, Value> {
        json!({
            "opus": "m1",
            "claude-opus-4": "m2",
            "sonnet": "m3"
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn longest_key_wins() {
        let mapper = ModelMapper::new();
        let m = mappings();
        assert_eq!(
            mapper.resolve(&m, "claude-opus-4-20250514").as_deref(),
            Some("m2")
        );
        assert_eq!(mapper.resolve(&m, "claude-opus-3").as_deref(), Some("m1"));
        assert_eq!(mapper.resolve(&m, "claude-sonnet-4").as_deref(), Some("m3"));
    }

    #[test]
    fn miss_falls_back_to_sonnet_mapping() {
        let mapper = ModelMapper::new();
        assert_eq!(mapper.resolve(&mappings(), "gpt-5").as_deref(), Some("m3"));
    }

    #[test]
    fn miss_without_sonnet_mapping_is_none() {
        let mapper = ModelMapper::new();
        let m = json!({ "opus": "m1" }).as_object().unwrap().clone();
        assert_eq!(mapper.resolve(&m, "gpt-5"), None);
    }

    #[test]
    fn key_order_is_cached_once_per_object() {
        let mapper = ModelMapper::new();
        let m = mappings();
        mapper.resolve(&m, "claude-opus-4");
        mapper.resolve(&m, "claude-sonnet-4");
        assert_eq!(mapper.cache_len(), 1);
    }

    #[test]
    fn cache_evicts_oldest_beyond_capacity() {
        let mapper = ModelMapper::new();
        for i in 0..(SORTED_KEYS_CACHE_SIZE + 5) {
            let mut m = Map::new();
            m.insert(format!("family-{i}"), json!("target"));
            mapper.resolve(&m, "anything");
        }
        assert_eq!(mapper.cache_len(), SORTED_KEYS_CACHE_SIZE);
    }
}
