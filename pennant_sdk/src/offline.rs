//! Offline snapshot persistence.
//!
//! The most recently successful snapshot is kept on disk as a JSON document
//! so evaluation can continue through network partitions. Writes go to a
//! `.tmp` sibling first and land via atomic rename, so a crash mid-write
//! never leaves a torn file behind.
use std::fs;
use std::path::PathBuf;

use pennant_core::snapshot::EnvSnapshot;
use pennant_core::Result;

pub struct OfflineStore {
    path: PathBuf,
}

impl OfflineStore {
    pub fn new(path: impl Into<PathBuf>) -> OfflineStore {
        OfflineStore { path: path.into() }
    }

    /// Persist a snapshot, replacing any previous one.
    pub fn save(&self, snapshot: &EnvSnapshot) -> Result<()> {
        let bytes = snapshot.canonical_bytes()?;
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        log::debug!(target: "pennant_sdk",
                    env_key:display = snapshot.env_key, version = snapshot.version;
                    "persisted offline snapshot");
        Ok(())
    }

    /// Load the persisted snapshot, if any. A missing or corrupt file is a
    /// plain `None` — offline fallback is best effort by nature.
    pub fn load(&self) -> Option<EnvSnapshot> {
        let bytes = fs::read(&self.path).ok()?;
        match EnvSnapshot::from_json(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                log::warn!(target: "pennant_sdk", error:display = err;
                           "offline snapshot file is corrupt; ignoring");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;

    fn snapshot(version: u64) -> EnvSnapshot {
        EnvSnapshot {
            env_key: "prod".to_owned(),
            version,
            salt: "s".to_owned(),
            updated_at: Utc::now(),
            etag: "e".to_owned(),
            flags: BTreeMap::new(),
            segments: BTreeMap::new(),
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::new(dir.path().join("prod.json"));

        assert!(store.load().is_none());
        store.save(&snapshot(3)).unwrap();
        assert_eq!(store.load().unwrap().version, 3);

        // Replacement is atomic: no .tmp residue after a successful save.
        store.save(&snapshot(4)).unwrap();
        assert_eq!(store.load().unwrap().version, 4);
        assert!(!dir.path().join("prod.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prod.json");
        fs::write(&path, b"not json").unwrap();
        assert!(OfflineStore::new(&path).load().is_none());
    }
}
