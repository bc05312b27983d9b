//! Canonical serialization and the ETag fingerprint.
//!
//! Snapshot maps are `BTreeMap`s, so `serde_json` already emits them in
//! sorted key order; combined with the fixed field order of the structs this
//! makes serialization a pure function of content. The ETag is the hex MD5
//! digest of the snapshot version (big-endian) followed by the canonical
//! body bytes, so any two compilations of identical content at the same
//! version agree byte-for-byte.
use std::collections::BTreeMap;

use serde::Serialize;

use super::{EnvSnapshot, FlagConfig, SegmentConfig, TryParse};
use crate::Result;

/// The fingerprinted portion of a snapshot: everything except `updated_at`
/// and the etag itself.
#[derive(Serialize)]
struct SnapshotBody<'a> {
    env_key: &'a str,
    version: u64,
    salt: &'a str,
    flags: &'a BTreeMap<String, TryParse<FlagConfig>>,
    segments: &'a BTreeMap<String, SegmentConfig>,
}

/// Compute the content fingerprint for a snapshot-in-progress.
pub fn compute_etag(
    env_key: &str,
    version: u64,
    salt: &str,
    flags: &BTreeMap<String, TryParse<FlagConfig>>,
    segments: &BTreeMap<String, SegmentConfig>,
) -> Result<String> {
    let body = SnapshotBody {
        env_key,
        version,
        salt,
        flags,
        segments,
    };
    let bytes = serde_json::to_vec(&body)?;

    let mut hasher = md5::Context::new();
    hasher.consume(version.to_be_bytes());
    hasher.consume(&bytes);
    Ok(hex::encode(*hasher.compute()))
}

impl EnvSnapshot {
    /// Serialize to the canonical wire form. Byte-identical for any two
    /// snapshots with equal content.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a snapshot from its wire form.
    pub fn from_json(bytes: &[u8]) -> Result<EnvSnapshot> {
        serde_json::from_slice(bytes)
            .map_err(|err| crate::Error::Internal(format!("malformed snapshot: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::snapshot::{FlagStatus, FlagType, Variation};

    fn boolean_flag(key: &str) -> FlagConfig {
        FlagConfig {
            key: key.to_owned(),
            flag_type: FlagType::Boolean,
            status: FlagStatus::Active,
            default_variation_key: "off".to_owned(),
            variations: BTreeMap::from([
                (
                    "off".to_owned(),
                    Variation {
                        key: "off".to_owned(),
                        value: false.into(),
                        name: None,
                        description: None,
                    },
                ),
                (
                    "on".to_owned(),
                    Variation {
                        key: "on".to_owned(),
                        value: true.into(),
                        name: None,
                        description: None,
                    },
                ),
            ]),
            rules: vec![],
            traffic_allocation: 1.0,
        }
    }

    #[test]
    fn etag_is_stable_across_compilations() {
        let flags = BTreeMap::from([
            ("a".to_owned(), TryParse::Parsed(boolean_flag("a"))),
            ("b".to_owned(), TryParse::Parsed(boolean_flag("b"))),
        ]);
        let segments = BTreeMap::new();

        let first = compute_etag("prod", 8, "salt", &flags, &segments).unwrap();
        let second = compute_etag("prod", 8, "salt", &flags, &segments).unwrap();
        assert_eq!(first, second);

        // A different version must change the fingerprint even for
        // identical content.
        let bumped = compute_etag("prod", 9, "salt", &flags, &segments).unwrap();
        assert_ne!(first, bumped);
    }

    #[test]
    fn canonical_bytes_round_trip() {
        let snapshot = EnvSnapshot {
            env_key: "prod".to_owned(),
            version: 3,
            salt: "s".to_owned(),
            updated_at: Utc::now(),
            etag: "00".to_owned(),
            flags: BTreeMap::from([("f".to_owned(), TryParse::Parsed(boolean_flag("f")))]),
            segments: BTreeMap::new(),
        };

        let bytes = snapshot.canonical_bytes().unwrap();
        let parsed = EnvSnapshot::from_json(&bytes).unwrap();
        assert_eq!(parsed.canonical_bytes().unwrap(), bytes);
    }

    #[test]
    fn map_iteration_is_key_sorted() {
        let flags = BTreeMap::from([
            ("zz".to_owned(), TryParse::Parsed(boolean_flag("zz"))),
            ("aa".to_owned(), TryParse::Parsed(boolean_flag("aa"))),
        ]);
        let body = serde_json::to_string(&SnapshotBody {
            env_key: "prod",
            version: 1,
            salt: "s",
            flags: &flags,
            segments: &BTreeMap::new(),
        })
        .unwrap();
        assert!(body.find(r#""aa""#).unwrap() < body.find(r#""zz""#).unwrap());
    }
}
