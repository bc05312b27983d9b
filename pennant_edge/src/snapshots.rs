//! Per-edge snapshot resolution.
//!
//! Each environment's snapshot moves through
//! `Absent → Loading → Ready(v) → Stale(v) → Ready(v')`: the first miss
//! starts a load, stream updates with a strictly-higher version mark the
//! entry stale, and a re-fetch brings it back to ready. Requests that arrive
//! during `Loading` coalesce onto the same in-flight load rather than
//! stampeding the cache or the compiler.
//!
//! Deserialized snapshots are kept in a small in-process LRU keyed by
//! `(env_key, version)` so the hot path never touches the shared cache.
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use pennant_core::authoring::{AuthoringStore, EnvironmentRecord};
use pennant_core::cache::{snapshot_cache_key, SnapshotCache};
use pennant_core::compiler;
use pennant_core::snapshot::{ConfigUpdate, EnvSnapshot, UpdateKind, UpdatePublisher};
use pennant_core::{Error, Result};

/// Deserialized snapshots kept per process.
const DECODED_CACHE_SIZE: usize = 64;

struct CurrentVersion {
    version: u64,
    stale: bool,
}

/// Cache-first, compiler-fallback snapshot loader.
pub struct SnapshotResolver {
    store: Arc<dyn AuthoringStore>,
    cache: Arc<dyn SnapshotCache>,
    decoded: Mutex<LruCache<(String, u64), Arc<EnvSnapshot>>>,
    current: Mutex<HashMap<String, CurrentVersion>>,
    /// One-flight gates, one per environment.
    loading: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SnapshotResolver {
    pub fn new(store: Arc<dyn AuthoringStore>, cache: Arc<dyn SnapshotCache>) -> SnapshotResolver {
        SnapshotResolver {
            store,
            cache,
            decoded: Mutex::new(LruCache::new(
                NonZeroUsize::new(DECODED_CACHE_SIZE).unwrap(),
            )),
            current: Mutex::new(HashMap::new()),
            loading: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the current snapshot for an environment.
    ///
    /// `publisher` receives the `ConfigUpdate` if resolution has to fall
    /// back to compiling a fresh snapshot.
    pub async fn resolve(
        &self,
        environment: &EnvironmentRecord,
        publisher: Arc<dyn UpdatePublisher>,
    ) -> Result<Arc<EnvSnapshot>> {
        if let Some(snapshot) = self.ready(&environment.env_key) {
            return Ok(snapshot);
        }

        let gate = {
            let mut loading = self.loading.lock().await;
            loading
                .entry(environment.env_key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        // Whoever held the gate before us may have finished the work.
        if let Some(snapshot) = self.ready(&environment.env_key) {
            return Ok(snapshot);
        }

        if let Some(bytes) = self.cache.get(&snapshot_cache_key(&environment.env_key))? {
            let snapshot = EnvSnapshot::from_json(&bytes)?;
            let known = self.current_version(&environment.env_key);
            if known.map_or(true, |version| snapshot.version >= version) {
                return Ok(self.adopt(snapshot));
            }
            // The shared cache is behind what this process has already
            // served; keep serving the newer snapshot if we still hold it.
            if let Some(existing) = self.decoded(&environment.env_key, known.unwrap_or(0)) {
                return Ok(existing);
            }
        }

        // Compile on miss. Store I/O is blocking; keep it off the runtime.
        let snapshot = {
            let store = Arc::clone(&self.store);
            let cache = Arc::clone(&self.cache);
            let env_id = environment.env_id;
            tokio::task::spawn_blocking(move || {
                compiler::compile_and_publish(
                    store.as_ref(),
                    cache.as_ref(),
                    publisher.as_ref(),
                    env_id,
                    None,
                )
            })
            .await
            .map_err(|err| Error::Internal(format!("compile task failed: {err}")))??
        };

        Ok(self.adopt(snapshot))
    }

    /// Called by the stream bus for every published update. Strictly-newer
    /// versions flip the entry to stale; stale or duplicate ones are
    /// ignored, keeping the committed version monotonic.
    pub fn note_update(&self, update: &ConfigUpdate) {
        if update.kind == UpdateKind::Error {
            return;
        }
        let mut current = self
            .current
            .lock()
            .expect("thread holding resolver lock should not panic");
        if let Some(entry) = current.get_mut(&update.env_key) {
            if update.version > entry.version {
                entry.stale = true;
            }
        }
    }

    /// The version this process currently serves for an environment.
    pub fn current_version(&self, env_key: &str) -> Option<u64> {
        let current = self
            .current
            .lock()
            .expect("thread holding resolver lock should not panic");
        current.get(env_key).map(|entry| entry.version)
    }

    fn ready(&self, env_key: &str) -> Option<Arc<EnvSnapshot>> {
        let version = {
            let current = self
                .current
                .lock()
                .expect("thread holding resolver lock should not panic");
            let entry = current.get(env_key)?;
            if entry.stale {
                return None;
            }
            entry.version
        };
        self.decoded(env_key, version)
    }

    fn decoded(&self, env_key: &str, version: u64) -> Option<Arc<EnvSnapshot>> {
        let mut decoded = self
            .decoded
            .lock()
            .expect("thread holding resolver lock should not panic");
        decoded.get(&(env_key.to_owned(), version)).cloned()
    }

    fn adopt(&self, snapshot: EnvSnapshot) -> Arc<EnvSnapshot> {
        let snapshot = Arc::new(snapshot);
        {
            let mut decoded = self
                .decoded
                .lock()
                .expect("thread holding resolver lock should not panic");
            decoded.put(
                (snapshot.env_key.clone(), snapshot.version),
                Arc::clone(&snapshot),
            );
        }
        {
            let mut current = self
                .current
                .lock()
                .expect("thread holding resolver lock should not panic");
            let entry = current
                .entry(snapshot.env_key.clone())
                .or_insert(CurrentVersion {
                    version: 0,
                    stale: true,
                });
            if snapshot.version >= entry.version {
                entry.version = snapshot.version;
                entry.stale = false;
            }
        }
        snapshot
    }
}
