//! The snapshot compiler.
//!
//! Turns the current authoring state of one environment into a fresh
//! [`EnvSnapshot`] and publishes it: version fetch-and-add, validation,
//! canonicalization, cache write, stream notification. Publish either
//! commits a complete snapshot or leaves cache state unchanged; a validation
//! failure after the version bump leaves a version gap, which consumers
//! tolerate by construction (they only compare for strictly-higher).
use std::collections::{BTreeMap, HashSet};

use chrono::Utc;

use crate::authoring::{AuthoringStore, PublishInputs};
use crate::cache::{snapshot_cache_key, SnapshotCache, DEFAULT_SNAPSHOT_TTL};
use crate::snapshot::{
    compute_etag, Condition, ConditionOperator, ConditionValue, ConfigUpdate, EnvSnapshot,
    FlagConfig, FlagStatus, RuleOutcome, SegmentConfig, TryParse, Value,
};
use crate::{Error, Result};

/// Compile the environment and publish the result to the snapshot cache and
/// the stream bus.
///
/// `changed_flag` scopes the stream notification: a publish triggered by a
/// single flag's transition emits a flag-scoped update so subscribers can
/// invalidate narrowly; an explicit environment publish emits an
/// environment-scoped one.
pub fn compile_and_publish(
    store: &dyn AuthoringStore,
    cache: &dyn SnapshotCache,
    publisher: &dyn crate::snapshot::UpdatePublisher,
    env_id: i64,
    changed_flag: Option<&str>,
) -> Result<EnvSnapshot> {
    let inputs = store.publish_inputs(env_id)?;
    let env_key = inputs.environment.env_key.clone();
    let version = inputs.environment.version;

    let snapshot = compile(inputs)?;

    let bytes = snapshot.canonical_bytes()?;
    cache.put(&snapshot_cache_key(&env_key), bytes, DEFAULT_SNAPSHOT_TTL)?;

    let update = match changed_flag {
        Some(flag_key) => ConfigUpdate::flag(&env_key, flag_key, version, snapshot.updated_at),
        None => ConfigUpdate::environment(&env_key, version, snapshot.updated_at),
    };
    publisher.publish(update);

    log::info!(target: "pennant",
               env_key, version, flag_count = snapshot.flags.len();
               "compiled and published environment snapshot");

    Ok(snapshot)
}

/// Pure compilation: validate and canonicalize one environment's authoring
/// state into a snapshot. No I/O.
pub fn compile(inputs: PublishInputs) -> Result<EnvSnapshot> {
    let environment = inputs.environment;

    let segments: BTreeMap<String, SegmentConfig> = inputs
        .segments
        .into_iter()
        .map(|record| {
            (
                record.key.clone(),
                SegmentConfig {
                    key: record.key,
                    conditions: record.conditions,
                },
            )
        })
        .collect();

    for segment in segments.values() {
        for condition in &segment.conditions {
            validate_segment_reference(condition, &segments)?;
        }
    }
    check_segment_cycles(&segments)?;

    let mut flags = BTreeMap::new();
    for record in inputs.flags {
        // Draft and archived flags don't contribute to the snapshot; a
        // previously published flag that is unpublished disappears here.
        if !record.published || record.status != FlagStatus::Active {
            continue;
        }
        let flag = compile_flag(record, &segments)?;
        flags.insert(flag.key.clone(), TryParse::Parsed(flag));
    }

    let etag = compute_etag(
        &environment.env_key,
        environment.version,
        &environment.salt,
        &flags,
        &segments,
    )?;

    Ok(EnvSnapshot {
        env_key: environment.env_key,
        version: environment.version,
        salt: environment.salt,
        updated_at: Utc::now(),
        etag,
        flags,
        segments,
    })
}

fn compile_flag(
    record: crate::authoring::FlagRecord,
    segments: &BTreeMap<String, SegmentConfig>,
) -> Result<FlagConfig> {
    let key = record.key;

    let mut variations = BTreeMap::new();
    for variation in record.variations {
        if variations
            .insert(variation.key.clone(), variation)
            .is_some()
        {
            return Err(Error::Validation(format!(
                "flag {key}: duplicate variation key"
            )));
        }
    }

    if !variations.contains_key(&record.default_variation_key) {
        return Err(Error::Validation(format!(
            "flag {key}: default variation {} does not exist",
            record.default_variation_key
        )));
    }

    validate_allocation(&key, record.traffic_allocation)?;

    let mut rules = record.rules;
    for rule in &mut rules {
        validate_allocation(&key, rule.traffic_allocation)?;

        for condition in &rule.conditions {
            validate_segment_reference(condition, segments)
                .map_err(|_| Error::Validation(format!("flag {key}: rule {}: segment reference does not resolve", rule.id)))?;
        }

        match &mut rule.outcome {
            RuleOutcome::Variation { variation_key } => {
                if !variations.contains_key(variation_key) {
                    return Err(Error::Validation(format!(
                        "flag {key}: rule {} references unknown variation {variation_key}",
                        rule.id
                    )));
                }
            }
            RuleOutcome::Rollout { rollout } => {
                let mut total: u64 = 0;
                for entry in &rollout.entries {
                    if !variations.contains_key(&entry.variation_key) {
                        return Err(Error::Validation(format!(
                            "flag {key}: rule {} rollout references unknown variation {}",
                            rule.id, entry.variation_key
                        )));
                    }
                    total += u64::from(entry.weight);
                }
                if total != u64::from(crate::snapshot::TOTAL_BUCKETS) {
                    return Err(Error::Validation(format!(
                        "flag {key}: rule {} rollout weights sum to {total}, expected 10000",
                        rule.id
                    )));
                }
                // Canonical ordering keeps bucketing stable under authoring
                // rearrangement.
                rollout
                    .entries
                    .sort_by(|a, b| a.variation_key.cmp(&b.variation_key));
            }
        }
    }

    Ok(FlagConfig {
        key,
        flag_type: record.flag_type,
        status: record.status,
        default_variation_key: record.default_variation_key,
        variations,
        rules,
        traffic_allocation: record.traffic_allocation,
    })
}

fn validate_allocation(flag_key: &str, allocation: f64) -> Result<()> {
    if (0.0..=1.0).contains(&allocation) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "flag {flag_key}: traffic allocation {allocation} is outside [0, 1]"
        )))
    }
}

fn validate_segment_reference(
    condition: &Condition,
    segments: &BTreeMap<String, SegmentConfig>,
) -> Result<()> {
    if condition.operator != ConditionOperator::Segment {
        return Ok(());
    }
    match &condition.value {
        ConditionValue::Single(Value::String(key)) if segments.contains_key(key) => Ok(()),
        ConditionValue::Single(Value::String(key)) => Err(Error::Validation(format!(
            "segment reference {key} does not resolve"
        ))),
        _ => Err(Error::Validation(
            "segment condition value must be a segment key".to_owned(),
        )),
    }
}

/// Segments may reference each other but never cyclically; the check runs
/// here, at compile time, not at evaluation time.
fn check_segment_cycles(segments: &BTreeMap<String, SegmentConfig>) -> Result<()> {
    fn visit(
        key: &str,
        segments: &BTreeMap<String, SegmentConfig>,
        visiting: &mut HashSet<String>,
        done: &mut HashSet<String>,
    ) -> Result<()> {
        if done.contains(key) {
            return Ok(());
        }
        if !visiting.insert(key.to_owned()) {
            return Err(Error::Validation(format!(
                "segment {key} participates in a reference cycle"
            )));
        }
        if let Some(segment) = segments.get(key) {
            for condition in &segment.conditions {
                if condition.operator == ConditionOperator::Segment {
                    if let ConditionValue::Single(Value::String(next)) = &condition.value {
                        visit(next, segments, visiting, done)?;
                    }
                }
            }
        }
        visiting.remove(key);
        done.insert(key.to_owned());
        Ok(())
    }

    let mut done = HashSet::new();
    for key in segments.keys() {
        visit(key, segments, &mut HashSet::new(), &mut done)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::authoring::{EnvironmentRecord, FlagRecord, SegmentRecord};
    use crate::snapshot::{
        FlagType, Rollout, RolloutEntry, Rule, UpdateKind, UpdatePublisher, Variation,
    };
    use crate::cache::InMemorySnapshotCache;

    struct FakeStore {
        environment: Mutex<EnvironmentRecord>,
        flags: Mutex<Vec<FlagRecord>>,
        segments: Vec<SegmentRecord>,
    }

    impl FakeStore {
        fn new(version: u64, flags: Vec<FlagRecord>, segments: Vec<SegmentRecord>) -> Self {
            FakeStore {
                environment: Mutex::new(EnvironmentRecord {
                    env_id: 1,
                    env_key: "prod".to_owned(),
                    salt: "S".to_owned(),
                    version,
                }),
                flags: Mutex::new(flags),
                segments,
            }
        }
    }

    impl AuthoringStore for FakeStore {
        fn environment_by_id(&self, _env_id: i64) -> crate::Result<EnvironmentRecord> {
            Ok(self.environment.lock().unwrap().clone())
        }
        fn environment_by_key(&self, _env_key: &str) -> crate::Result<EnvironmentRecord> {
            Ok(self.environment.lock().unwrap().clone())
        }
        fn publish_inputs(&self, _env_id: i64) -> crate::Result<PublishInputs> {
            let mut environment = self.environment.lock().unwrap();
            environment.version += 1;
            Ok(PublishInputs {
                environment: environment.clone(),
                flags: self.flags.lock().unwrap().clone(),
                segments: self.segments.clone(),
            })
        }
        fn set_flag_published(
            &self,
            _env_id: i64,
            flag_key: &str,
            published: bool,
        ) -> crate::Result<()> {
            let mut flags = self.flags.lock().unwrap();
            let flag = flags
                .iter_mut()
                .find(|f| f.key == flag_key)
                .ok_or(Error::NotFound("flag"))?;
            if flag.published == published {
                return Err(Error::Conflict("publish state unchanged".to_owned()));
            }
            flag.published = published;
            flag.version += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        updates: Mutex<Vec<ConfigUpdate>>,
    }

    impl UpdatePublisher for RecordingPublisher {
        fn publish(&self, update: ConfigUpdate) {
            self.updates.lock().unwrap().push(update);
        }
    }

    fn variation(key: &str, value: impl Into<Value>) -> Variation {
        Variation {
            key: key.to_owned(),
            value: value.into(),
            name: None,
            description: None,
        }
    }

    fn flag(key: &str) -> FlagRecord {
        FlagRecord {
            flag_id: 1,
            env_id: 1,
            key: key.to_owned(),
            flag_type: FlagType::Boolean,
            status: FlagStatus::Active,
            default_variation_key: "off".to_owned(),
            variations: vec![variation("off", false), variation("on", true)],
            rules: vec![],
            traffic_allocation: 1.0,
            published: true,
            version: 1,
        }
    }

    // Publish cycle: version 7 becomes 8, the cache holds the snapshot, and
    // a flag-scoped update for the triggering flag goes out on the stream.
    #[test]
    fn publish_cycle() {
        let store = FakeStore::new(7, vec![flag("f")], vec![]);
        let cache = InMemorySnapshotCache::new();
        let publisher = RecordingPublisher::default();

        let snapshot =
            compile_and_publish(&store, &cache, &publisher, 1, Some("f")).unwrap();
        assert_eq!(snapshot.version, 8);

        let cached = cache.get("snapshot:prod").unwrap().unwrap();
        let parsed = EnvSnapshot::from_json(&cached).unwrap();
        assert_eq!(parsed.version, 8);
        assert_eq!(parsed.etag, snapshot.etag);

        let updates = publisher.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].kind, UpdateKind::Flag);
        assert_eq!(updates[0].flag_key.as_deref(), Some("f"));
        assert_eq!(updates[0].version, 8);
        assert_eq!(updates[0].env_key, "prod");
    }

    #[test]
    fn drafts_and_archived_flags_are_omitted() {
        let mut draft = flag("draft");
        draft.published = false;
        let mut archived = flag("archived");
        archived.status = FlagStatus::Archived;

        let store = FakeStore::new(0, vec![flag("live"), draft, archived], vec![]);
        let snapshot = compile_and_publish(
            &store,
            &InMemorySnapshotCache::new(),
            &crate::snapshot::NoopPublisher,
            1,
            None,
        )
        .unwrap();

        assert!(snapshot.flags.contains_key("live"));
        assert!(!snapshot.flags.contains_key("draft"));
        assert!(!snapshot.flags.contains_key("archived"));
    }

    #[test]
    fn validation_failure_leaves_a_version_gap_and_no_cache_write() {
        let mut bad = flag("bad");
        bad.default_variation_key = "ghost".to_owned();
        let store = FakeStore::new(3, vec![bad], vec![]);
        let cache = InMemorySnapshotCache::new();

        let err = compile_and_publish(&store, &cache, &crate::snapshot::NoopPublisher, 1, None)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(cache.get("snapshot:prod").unwrap().is_none());

        // The burned version is preferable to a partial snapshot: the next
        // successful publish lands at 5, not 4.
        let fixed = {
            let mut flags = store.flags.lock().unwrap();
            flags[0].default_variation_key = "off".to_owned();
            drop(flags);
            compile_and_publish(&store, &cache, &crate::snapshot::NoopPublisher, 1, None).unwrap()
        };
        assert_eq!(fixed.version, 5);
    }

    #[test]
    fn rollout_weights_must_sum_exactly() {
        let mut f = flag("f");
        f.rules = vec![Rule {
            id: "r1".to_owned(),
            conditions: vec![],
            outcome: RuleOutcome::Rollout {
                rollout: Rollout {
                    entries: vec![
                        RolloutEntry {
                            variation_key: "on".to_owned(),
                            weight: 3000,
                        },
                        RolloutEntry {
                            variation_key: "off".to_owned(),
                            weight: 6999,
                        },
                    ],
                },
            },
            traffic_allocation: 1.0,
        }];
        let store = FakeStore::new(0, vec![f], vec![]);
        let err = compile_and_publish(
            &store,
            &InMemorySnapshotCache::new(),
            &crate::snapshot::NoopPublisher,
            1,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn rollout_entries_are_canonically_sorted() {
        let mut f = flag("f");
        f.rules = vec![Rule {
            id: "r1".to_owned(),
            conditions: vec![],
            outcome: RuleOutcome::Rollout {
                rollout: Rollout {
                    entries: vec![
                        RolloutEntry {
                            variation_key: "on".to_owned(),
                            weight: 3000,
                        },
                        RolloutEntry {
                            variation_key: "off".to_owned(),
                            weight: 7000,
                        },
                    ],
                },
            },
            traffic_allocation: 1.0,
        }];
        let store = FakeStore::new(0, vec![f], vec![]);
        let snapshot = compile_and_publish(
            &store,
            &InMemorySnapshotCache::new(),
            &crate::snapshot::NoopPublisher,
            1,
            None,
        )
        .unwrap();

        let TryParse::Parsed(compiled) = &snapshot.flags["f"] else {
            panic!("flag should parse");
        };
        let RuleOutcome::Rollout { rollout } = &compiled.rules[0].outcome else {
            panic!("rule should be a rollout");
        };
        let keys: Vec<_> = rollout
            .entries
            .iter()
            .map(|e| e.variation_key.as_str())
            .collect();
        assert_eq!(keys, vec!["off", "on"]);
    }

    #[test]
    fn segment_cycles_are_rejected() {
        let segment = |key: &str, referenced: &str| SegmentRecord {
            segment_id: 0,
            env_id: 1,
            key: key.to_owned(),
            conditions: vec![Condition {
                attribute: String::new(),
                operator: ConditionOperator::Segment,
                value: referenced.into(),
            }],
        };
        let store = FakeStore::new(
            0,
            vec![],
            vec![segment("a", "b"), segment("b", "a")],
        );
        let err = compile_and_publish(
            &store,
            &InMemorySnapshotCache::new(),
            &crate::snapshot::NoopPublisher,
            1,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn dangling_segment_reference_is_rejected() {
        let mut f = flag("f");
        f.rules = vec![Rule {
            id: "r1".to_owned(),
            conditions: vec![Condition {
                attribute: String::new(),
                operator: ConditionOperator::Segment,
                value: "ghost".into(),
            }],
            outcome: RuleOutcome::Variation {
                variation_key: "on".to_owned(),
            },
            traffic_allocation: 1.0,
        }];
        let store = FakeStore::new(0, vec![f], vec![]);
        let err = compile_and_publish(
            &store,
            &InMemorySnapshotCache::new(),
            &crate::snapshot::NoopPublisher,
            1,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    // Two compilations of identical content at the same version must agree
    // byte-for-byte on the fingerprint.
    #[test]
    fn etag_agrees_for_identical_content() {
        let store_a = FakeStore::new(0, vec![flag("f")], vec![]);
        let store_b = FakeStore::new(0, vec![flag("f")], vec![]);
        let a = compile(store_a.publish_inputs(1).unwrap()).unwrap();
        let b = compile(store_b.publish_inputs(1).unwrap()).unwrap();
        assert_eq!(a.etag, b.etag);
    }
}
