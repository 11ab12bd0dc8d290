use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Process-local TTL + LRU-ish cache for billing lookups.
///
/// Per-process only: stale entries are bounded by the TTL, and config changes
/// must call `invalidate_all` / `invalidate_model` explicitly. Keys embed the
/// runtime knobs that affect the cached value.
#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, (V, Instant)>>,
}

pub const RULE_CACHE_TTL: Duration = Duration::from_secs(300);
pub const RULE_CACHE_MAX_ENTRIES: usize = 2048;

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut guard = self.entries.lock().ok()?;
        match guard.get(key) {
            Some((value, stored_at)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: String, value: V) {
        let Ok(mut guard) = self.entries.lock() else {
            return;
        };
        guard.insert(key, (value, Instant::now()));
        if guard.len() > self.max_entries {
            // Evict the oldest quarter to amortize the sort.
            let mut stamps: Vec<(String, Instant)> = guard
                .iter()
                .map(|(k, (_, at))| (k.clone(), *at))
                .collect();
            stamps.sort_by_key(|(_, at)| *at);
            for (key, _) in stamps.into_iter().take(self.max_entries / 4) {
                guard.remove(&key);
            }
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.clear();
        }
    }

    /// Best-effort substring invalidation; cache keys must embed the model name.
    pub fn invalidate_containing(&self, needle: &str) {
        if needle.is_empty() {
            return;
        }
        if let Ok(mut guard) = self.entries.lock() {
            guard.retain(|key, _| !key.contains(needle));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_miss() {
        let cache: TtlCache<i32> = TtlCache::new(Duration::from_millis(0), 16);
        cache.set("a".to_string(), 1);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn substring_invalidation_targets_model_keys() {
        let cache: TtlCache<i32> = TtlCache::new(Duration::from_secs(60), 16);
        cache.set("1:gpt-4o:chat:require=0".to_string(), 1);
        cache.set("1:claude-sonnet:chat:require=0".to_string(), 2);
        cache.invalidate_containing("gpt-4o");
        assert_eq!(cache.get("1:gpt-4o:chat:require=0"), None);
        assert_eq!(cache.get("1:claude-sonnet:chat:require=0"), Some(2));
    }

    #[test]
    fn overflow_evicts_oldest() {
        let cache: TtlCache<i32> = TtlCache::new(Duration::from_secs(60), 8);
        for i in 0..10 {
            cache.set(format!("k{i}"), i);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(cache.len() <= 8);
        assert_eq!(cache.get("k9"), Some(9));
    }
}
