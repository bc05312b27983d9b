//! Snapshot cache contract and an in-process implementation.
//!
//! The shared cache holds compiled snapshots under `snapshot:{env_key}`.
//! Only the compiler writes; everything else reads. The in-memory
//! implementation backs tests and single-node deployments; a shared
//! key-value store slots in behind the same trait for fleets.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::Result;

/// Default time-to-live for cached snapshots.
pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cache key for an environment's current snapshot.
pub fn snapshot_cache_key(env_key: &str) -> String {
    format!("snapshot:{env_key}")
}

/// Shared key-value cache of compiled snapshots. Values are canonical
/// snapshot bytes, opaque to the cache.
pub trait SnapshotCache: Send + Sync {
    #[allow(missing_docs)]
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    #[allow(missing_docs)]
    fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
}

/// In-process [`SnapshotCache`] with per-entry expiry.
#[derive(Default)]
pub struct InMemorySnapshotCache {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl InMemorySnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotCache for InMemorySnapshotCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self
            .entries
            .lock()
            .expect("thread holding cache lock should not panic");
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .expect("thread holding cache lock should not panic");
        entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_put_round_trip() {
        let cache = InMemorySnapshotCache::new();
        cache
            .put("snapshot:prod", b"abc".to_vec(), Duration::from_secs(60))
            .unwrap();
        assert_eq!(cache.get("snapshot:prod").unwrap(), Some(b"abc".to_vec()));
        assert_eq!(cache.get("snapshot:other").unwrap(), None);
    }

    #[test]
    fn entries_expire() {
        let cache = InMemorySnapshotCache::new();
        cache
            .put("snapshot:prod", b"abc".to_vec(), Duration::from_secs(0))
            .unwrap();
        assert_eq!(cache.get("snapshot:prod").unwrap(), None);
    }
}
