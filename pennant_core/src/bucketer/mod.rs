//! The deterministic evaluation kernel.
//!
//! Pure function family mapping `(snapshot, flag_key, user)` to an
//! [`EvaluationResult`]. No I/O, no clocks, no randomness beyond the
//! environment salt carried by the snapshot: identical inputs yield
//! identical decisions on every evaluator instance and every SDK.
pub mod hash;

mod eval;
mod rules;

use serde::{Deserialize, Serialize};

pub use eval::evaluate;

use crate::snapshot::Value;

/// Output of one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub flag_key: String,
    /// Key of the served variation; empty when the flag itself was absent.
    pub variation_key: String,
    pub value: Value,
    pub reason: EvaluationReason,
    /// Set when a rule decided the outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    /// Bucket in `[0, 9999]` derived from the bucketing id.
    pub bucket: u32,
    /// Opaque hash seeding all bucketing decisions for this
    /// `(flag, user)` pair.
    pub bucketing_id: u32,
}

/// Why a particular variation was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum EvaluationReason {
    /// Flag absent or not active.
    Off,
    /// No rule fired, or the flag-level traffic gate excluded the user.
    Default,
    /// A rule with a fixed variation matched.
    RuleMatch,
    /// A rule with a weighted rollout matched.
    Rollout,
    /// Individual targeting (reserved; not produced by the rule scan).
    Targeting,
    /// Evaluation could not run; the default value was served.
    Error,
    /// Served from the offline snapshot file.
    Offline,
}

impl EvaluationResult {
    /// True when a non-default variation was actually served, i.e. the
    /// evaluations for which an exposure record is emitted.
    pub fn served_non_default(&self) -> bool {
        matches!(
            self.reason,
            EvaluationReason::RuleMatch | EvaluationReason::Rollout | EvaluationReason::Targeting
        )
    }
}
