use crate::snapshot::{
    EnvSnapshot, FlagConfig, FlagStatus, Rollout, RuleOutcome, TryParse, Value, TOTAL_BUCKETS,
};
use crate::{EvaluationError, UserContext};

use super::hash;
use super::{EvaluationReason, EvaluationResult};

/// Evaluate one flag for the given user against a snapshot.
///
/// Never fails on a compiler-produced snapshot: every condition that cannot
/// be decided resolves toward the default variation. The only `error`-reason
/// results are an empty `user_key` and internal inconsistencies in snapshots
/// that bypassed compilation.
pub fn evaluate(snapshot: &EnvSnapshot, flag_key: &str, user: &UserContext) -> EvaluationResult {
    let flag = match snapshot.flag(flag_key) {
        Some(TryParse::Parsed(flag)) => flag,
        Some(TryParse::ParseFailed(_)) => {
            log::warn!(target: "pennant",
                       flag_key, env_key:display = snapshot.env_key;
                       "flag configuration failed to parse; serving off");
            return absent(flag_key, EvaluationReason::Off);
        }
        None => return absent(flag_key, EvaluationReason::Off),
    };

    if flag.status != FlagStatus::Active {
        return default_result(flag, flag_key, EvaluationReason::Off, 0, 0);
    }

    if user.user_key.is_empty() {
        log::warn!(target: "pennant", flag_key; "{}", EvaluationError::MissingUserKey);
        return default_result(flag, flag_key, EvaluationReason::Error, 0, 0);
    }

    let bucketing_id = hash::bucketing_id(&snapshot.salt, flag_key, &user.user_key);
    let bucket = hash::bucket(bucketing_id);

    // Flag-level traffic allocation gates the whole rule scan.
    if !within_allocation(hash::flag_gate_bucket(bucketing_id), flag.traffic_allocation) {
        return default_result(flag, flag_key, EvaluationReason::Default, bucket, bucketing_id);
    }

    for rule in &flag.rules {
        if !rule.matches(snapshot, user) {
            continue;
        }

        let rule_bucket = hash::sub_bucket(bucketing_id, rule.id.as_bytes());

        // A matched rule outside its allocation window is skipped, not
        // matched: subsequent rules may still fire.
        if !within_allocation(rule_bucket, rule.traffic_allocation) {
            continue;
        }

        match &rule.outcome {
            RuleOutcome::Variation { variation_key } => {
                return variation_result(
                    flag,
                    flag_key,
                    variation_key,
                    EvaluationReason::RuleMatch,
                    Some(rule.id.clone()),
                    bucket,
                    bucketing_id,
                );
            }
            RuleOutcome::Rollout { rollout } => {
                let Some(variation_key) = select_rollout(rollout, rule_bucket) else {
                    // Weights that do not cover the bucket space only exist
                    // in snapshots that bypassed compilation.
                    log::error!(target: "pennant",
                                flag_key, rule_id:display = rule.id;
                                "{}", EvaluationError::InconsistentSnapshot);
                    return default_result(
                        flag,
                        flag_key,
                        EvaluationReason::Error,
                        bucket,
                        bucketing_id,
                    );
                };
                return variation_result(
                    flag,
                    flag_key,
                    &variation_key,
                    EvaluationReason::Rollout,
                    Some(rule.id.clone()),
                    bucket,
                    bucketing_id,
                );
            }
        }
    }

    default_result(flag, flag_key, EvaluationReason::Default, bucket, bucketing_id)
}

/// `bucket_value` is uniform in `[0, 9999]`; the allocation claims the first
/// `allocation * 10000` buckets.
fn within_allocation(bucket_value: u32, allocation: f64) -> bool {
    if allocation >= 1.0 {
        return true;
    }
    let threshold = (allocation.max(0.0) * TOTAL_BUCKETS as f64).round() as u32;
    bucket_value < threshold
}

/// Pick the rollout entry whose cumulative weight range contains `bucket`.
/// Entries are ordered by variation key so the assignment is stable under
/// authoring rearrangement.
fn select_rollout(rollout: &Rollout, bucket: u32) -> Option<String> {
    let mut entries: Vec<_> = rollout.entries.iter().collect();
    entries.sort_by(|a, b| a.variation_key.cmp(&b.variation_key));

    let mut cumulative = 0u32;
    for entry in entries {
        cumulative = cumulative.saturating_add(entry.weight);
        if bucket < cumulative {
            return Some(entry.variation_key.clone());
        }
    }
    None
}

fn absent(flag_key: &str, reason: EvaluationReason) -> EvaluationResult {
    EvaluationResult {
        flag_key: flag_key.to_owned(),
        variation_key: String::new(),
        value: Value::null(),
        reason,
        rule_id: None,
        bucket: 0,
        bucketing_id: 0,
    }
}

fn default_result(
    flag: &FlagConfig,
    flag_key: &str,
    reason: EvaluationReason,
    bucket: u32,
    bucketing_id: u32,
) -> EvaluationResult {
    match flag.default_variation() {
        Some(variation) => EvaluationResult {
            flag_key: flag_key.to_owned(),
            variation_key: variation.key.clone(),
            value: variation.value.clone(),
            reason,
            rule_id: None,
            bucket,
            bucketing_id,
        },
        None => {
            log::error!(target: "pennant", flag_key; "{}", EvaluationError::InconsistentSnapshot);
            let mut result = absent(flag_key, EvaluationReason::Error);
            result.bucket = bucket;
            result.bucketing_id = bucketing_id;
            result
        }
    }
}

fn variation_result(
    flag: &FlagConfig,
    flag_key: &str,
    variation_key: &str,
    reason: EvaluationReason,
    rule_id: Option<String>,
    bucket: u32,
    bucketing_id: u32,
) -> EvaluationResult {
    match flag.variations.get(variation_key) {
        Some(variation) => EvaluationResult {
            flag_key: flag_key.to_owned(),
            variation_key: variation.key.clone(),
            value: variation.value.clone(),
            reason,
            rule_id,
            bucket,
            bucketing_id,
        },
        None => {
            log::error!(target: "pennant",
                        flag_key, variation_key;
                        "{}", EvaluationError::InconsistentSnapshot);
            default_result(flag, flag_key, EvaluationReason::Error, bucket, bucketing_id)
        }
    }
}
