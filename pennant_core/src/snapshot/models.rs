use std::collections::BTreeMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

#[allow(missing_docs)]
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Number of buckets every bucketing decision is made over. Weights are
/// expressed in basis points against this total.
pub const TOTAL_BUCKETS: u32 = 10_000;

/// Immutable, versioned bundle of all published flags and segments for one
/// environment. This is both the snapshot-cache value and the body served by
/// `GET /configs/{env_key}`.
///
/// Flag values are wrapped in [`TryParse`] so that one unparsable flag (e.g.,
/// written by a newer compiler) does not take the rest of the snapshot down.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnvSnapshot {
    /// URL-safe environment key.
    pub env_key: String,
    /// Monotonic publish counter. Consumers accept strictly-higher versions
    /// and ignore stale ones.
    pub version: u64,
    /// Opaque bucketing salt, immutable for the lifetime of the environment.
    pub salt: String,
    /// When this snapshot was compiled.
    pub updated_at: Timestamp,
    /// Content fingerprint over `(version, canonical body)`; see
    /// [`compute_etag`](super::compute_etag).
    pub etag: String,
    /// Published flags, keyed by flag key. Sorted iteration keeps the
    /// serialization canonical.
    pub flags: BTreeMap<String, TryParse<FlagConfig>>,
    /// Segments, keyed by segment key.
    pub segments: BTreeMap<String, SegmentConfig>,
}

impl EnvSnapshot {
    /// Look up a flag, treating parse failures as absent-with-error.
    pub fn flag(&self, key: &str) -> Option<&TryParse<FlagConfig>> {
        self.flags.get(key)
    }
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing
/// of the whole structure.
///
/// This can be helpful to isolate errors in a subtree. e.g., if configuration
/// for one flag parses, the rest of the flags are still usable.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}
impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// One flag as compiled into a snapshot.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(missing_docs)]
pub struct FlagConfig {
    pub key: String,
    pub flag_type: FlagType,
    pub status: FlagStatus,
    pub default_variation_key: String,
    pub variations: BTreeMap<String, Variation>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default = "default_traffic_allocation")]
    pub traffic_allocation: f64,
}

fn default_traffic_allocation() -> f64 {
    1.0
}

impl FlagConfig {
    /// The variation served when nothing more specific fires.
    pub fn default_variation(&self) -> Option<&Variation> {
        self.variations.get(&self.default_variation_key)
    }
}

/// Declared type of a flag's variations.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum FlagType {
    Boolean,
    String,
    Number,
    Json,
    Multivariate,
}

/// Lifecycle state. Archived flags stay resolvable but always serve the
/// default with reason `off`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum FlagStatus {
    Active,
    Archived,
}

/// Subset of [`serde_json::Value`] a variation can carry.
///
/// Untagged; the declared [`FlagType`] at the flag level says how to read it.
/// `Json` must stay the last variant so that objects, arrays, and null fall
/// through to it.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum Value {
    /// A boolean value.
    Boolean(bool),
    /// A numeric value.
    Number(f64),
    /// A string value.
    String(String),
    /// Arbitrary JSON (objects, arrays, null).
    Json(serde_json::Value),
}

impl Value {
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Null JSON value, used where no variation resolves at all.
    pub fn null() -> Value {
        Value::Json(serde_json::Value::Null)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// One typed outcome of a flag.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(missing_docs)]
pub struct Variation {
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Ordered targeting clause. Rules are evaluated in authoring order; the
/// compiler never reorders them.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Rule {
    /// Stable rule identity; mixed into the bucketing hash so per-rule
    /// decisions decorrelate.
    pub id: String,
    /// AND-combined conditions. An empty list matches everyone.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Exactly one of a fixed variation or a weighted rollout.
    #[serde(flatten)]
    pub outcome: RuleOutcome,
    /// Fraction of matched traffic this rule claims. A user outside the
    /// window skips the rule; scanning continues.
    #[serde(default = "default_traffic_allocation")]
    pub traffic_allocation: f64,
}

/// What a matched rule serves.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum RuleOutcome {
    /// Serve a fixed variation.
    Variation {
        #[allow(missing_docs)]
        variation_key: String,
    },
    /// Split matched traffic across weighted variations.
    Rollout {
        #[allow(missing_docs)]
        rollout: Rollout,
    },
}

/// Weighted, exhaustive partition of buckets over variations.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Rollout {
    /// Entries sorted by variation key at compile time; weights are basis
    /// points summing to exactly [`TOTAL_BUCKETS`].
    pub entries: Vec<RolloutEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(missing_docs)]
pub struct RolloutEntry {
    pub variation_key: String,
    pub weight: u32,
}

/// `Condition` is a check that the user attribute named `attribute` relates
/// to `value` under the given `operator`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(missing_docs)]
pub struct Condition {
    pub attribute: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: ConditionValue,
}

/// Attribute test operators.
///
/// String comparisons are byte-exact unless `semver_*`. Numeric operators
/// coerce both sides to f64 and evaluate false when coercion fails. Missing
/// attributes fail every operator except `not_exists`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ConditionOperator {
    Eq,
    Neq,
    In,
    Nin,
    Contains,
    StartsWith,
    EndsWith,
    Lt,
    Lte,
    Gt,
    Gte,
    Regex,
    SemverEq,
    SemverGt,
    SemverGte,
    SemverLt,
    SemverLte,
    /// Resolves a named segment's conditions inside the same snapshot.
    Segment,
    Exists,
    NotExists,
}

#[derive(Debug, Serialize, Deserialize, Clone, From)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum ConditionValue {
    Single(Value),
    // Only string arrays are supported for membership tests.
    Multiple(Vec<String>),
}

impl Default for ConditionValue {
    fn default() -> Self {
        ConditionValue::Single(Value::null())
    }
}

impl From<&str> for ConditionValue {
    fn from(value: &str) -> Self {
        ConditionValue::Single(value.into())
    }
}
impl From<f64> for ConditionValue {
    fn from(value: f64) -> Self {
        ConditionValue::Single(value.into())
    }
}
impl From<bool> for ConditionValue {
    fn from(value: bool) -> Self {
        ConditionValue::Single(value.into())
    }
}

/// Named reusable condition bundle, referenced from rules via the `segment`
/// operator. Conditions are AND-combined. Segment references may nest but the
/// compiler rejects cycles.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(missing_docs)]
pub struct SegmentConfig {
    pub key: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
