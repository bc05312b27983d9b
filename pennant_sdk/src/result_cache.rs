//! LRU result cache keyed by `(flag_key, user_key)`.
//!
//! Sharded: each shard is an LRU behind its own mutex, so writes are
//! serialized per key while readers of other shards never contend. Entries
//! carry a deadline; lookups past it behave as misses. Insertion and LRU
//! eviction happen under one shard lock, so a concurrent reader never sees
//! a half-updated shard.
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use pennant_core::bucketer::EvaluationResult;

const SHARD_COUNT: usize = 8;

struct Entry {
    result: EvaluationResult,
    expires_at: Instant,
}

pub struct ResultCache {
    shards: Vec<Mutex<LruCache<(String, String), Entry>>>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> ResultCache {
        let per_shard = capacity.div_ceil(SHARD_COUNT).max(1);
        let shards = (0..SHARD_COUNT)
            .map(|_| {
                Mutex::new(LruCache::new(
                    NonZeroUsize::new(per_shard).expect("per-shard capacity is non-zero"),
                ))
            })
            .collect();
        ResultCache { shards, ttl }
    }

    pub fn get(&self, flag_key: &str, user_key: &str) -> Option<EvaluationResult> {
        let key = (flag_key.to_owned(), user_key.to_owned());
        let mut shard = self.shard(&key).lock().expect("result cache lock poisoned");
        match shard.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.result.clone()),
            Some(_) => {
                shard.pop(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, result: EvaluationResult, user_key: &str) {
        let key = (result.flag_key.clone(), user_key.to_owned());
        let entry = Entry {
            result,
            expires_at: Instant::now() + self.ttl,
        };
        let mut shard = self.shard(&key).lock().expect("result cache lock poisoned");
        shard.put(key, entry);
    }

    /// Drop one `(flag, user)` entry.
    pub fn invalidate(&self, flag_key: &str, user_key: &str) {
        let key = (flag_key.to_owned(), user_key.to_owned());
        let mut shard = self.shard(&key).lock().expect("result cache lock poisoned");
        shard.pop(&key);
    }

    /// Drop every user's entry for one flag; unrelated flags survive.
    pub fn invalidate_flag(&self, flag_key: &str) {
        for shard in &self.shards {
            let mut shard = shard.lock().expect("result cache lock poisoned");
            let doomed: Vec<(String, String)> = shard
                .iter()
                .filter(|((flag, _), _)| flag.as_str() == flag_key)
                .map(|(key, _)| key.clone())
                .collect();
            for key in doomed {
                shard.pop(&key);
            }
        }
    }

    /// Drop everything (environment-scoped update).
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().expect("result cache lock poisoned").clear();
        }
    }

    fn shard(&self, key: &(String, String)) -> &Mutex<LruCache<(String, String), Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }
}

#[cfg(test)]
mod tests {
    use pennant_core::bucketer::EvaluationReason;

    use super::*;

    fn result(flag: &str) -> EvaluationResult {
        EvaluationResult {
            flag_key: flag.to_owned(),
            variation_key: "on".to_owned(),
            value: true.into(),
            reason: EvaluationReason::RuleMatch,
            rule_id: None,
            bucket: 1,
            bucketing_id: 1,
        }
    }

    #[test]
    fn get_put_round_trip() {
        let cache = ResultCache::new(100, Duration::from_secs(60));
        assert!(cache.get("f", "alice").is_none());
        cache.put(result("f"), "alice");
        assert_eq!(cache.get("f", "alice").unwrap().variation_key, "on");
        assert!(cache.get("f", "bob").is_none());
    }

    #[test]
    fn entries_expire() {
        let cache = ResultCache::new(100, Duration::from_millis(0));
        cache.put(result("f"), "alice");
        assert!(cache.get("f", "alice").is_none());
    }

    #[test]
    fn flag_invalidation_spares_other_flags() {
        let cache = ResultCache::new(100, Duration::from_secs(60));
        cache.put(result("f"), "alice");
        cache.put(result("f"), "bob");
        cache.put(result("g"), "alice");

        cache.invalidate_flag("f");
        assert!(cache.get("f", "alice").is_none());
        assert!(cache.get("f", "bob").is_none());
        assert!(cache.get("g", "alice").is_some());
    }

    #[test]
    fn clear_drops_everything() {
        let cache = ResultCache::new(100, Duration::from_secs(60));
        cache.put(result("f"), "alice");
        cache.put(result("g"), "bob");
        cache.clear();
        assert!(cache.get("f", "alice").is_none());
        assert!(cache.get("g", "bob").is_none());
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = ResultCache::new(8, Duration::from_secs(60));
        for i in 0..1000 {
            cache.put(result(&format!("flag-{i}")), "u");
        }
        let retained = (0..1000)
            .filter(|i| cache.get(&format!("flag-{i}"), "u").is_some())
            .count();
        // Shard capacity is total/shards; retained entries can never exceed
        // the configured total.
        assert!(retained <= 8);
        assert!(retained > 0);
    }
}
