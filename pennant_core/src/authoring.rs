//! Authoring-side records and the store contract.
//!
//! These are the mutable, persisted shapes flags and segments live in while
//! being edited. They only affect resolution once published, at which point
//! the compiler turns them into immutable snapshot types. Authoring-side
//! flag versions (optimistic concurrency) are distinct from snapshot
//! versions (the environment's monotonic publish counter).
use serde::{Deserialize, Serialize};

use crate::snapshot::{Condition, FlagStatus, FlagType, Rule, Timestamp, Variation};
use crate::Result;

/// Isolation unit of flag resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub env_id: i64,
    /// URL-safe, unique.
    pub env_key: String,
    /// Opaque bucketing salt. Assigned at creation, never changed; every
    /// bucketing decision for this environment depends on it.
    pub salt: String,
    /// Monotonic publish counter, strictly increased on every publish.
    pub version: u64,
}

/// A flag as authored, before compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagRecord {
    pub flag_id: i64,
    pub env_id: i64,
    /// Unique within the environment.
    pub key: String,
    pub flag_type: FlagType,
    pub status: FlagStatus,
    pub default_variation_key: String,
    pub variations: Vec<Variation>,
    pub rules: Vec<Rule>,
    pub traffic_allocation: f64,
    /// Draft flags don't contribute to snapshots.
    pub published: bool,
    /// Authoring-side optimistic-concurrency version.
    pub version: u64,
}

/// A segment as authored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub segment_id: i64,
    pub env_id: i64,
    /// Unique within the environment.
    pub key: String,
    pub conditions: Vec<Condition>,
}

/// Everything one compilation needs, read under a single store transaction.
#[derive(Debug, Clone)]
pub struct PublishInputs {
    /// The environment with its freshly incremented version. The increment
    /// commits with the read, so two racing compilations get distinct
    /// versions and the higher one supersedes.
    pub environment: EnvironmentRecord,
    /// All flags of the environment, drafts included; the compiler filters.
    pub flags: Vec<FlagRecord>,
    pub segments: Vec<SegmentRecord>,
}

/// Persistent truth for flags, segments, and environments.
///
/// Implementations must make [`publish_inputs`](AuthoringStore::publish_inputs)
/// atomic: the version fetch-and-add and the state read happen in one
/// snapshot-isolated transaction. That atomicity is the platform's
/// single-writer guarantee per environment.
pub trait AuthoringStore: Send + Sync {
    #[allow(missing_docs)]
    fn environment_by_id(&self, env_id: i64) -> Result<EnvironmentRecord>;

    #[allow(missing_docs)]
    fn environment_by_key(&self, env_key: &str) -> Result<EnvironmentRecord>;

    /// Atomically increment the environment version and read the full
    /// authoring state under the same transaction.
    fn publish_inputs(&self, env_id: i64) -> Result<PublishInputs>;

    /// Flip a flag's `published` bit, bumping its authoring version.
    /// Returns [`Conflict`](crate::Error::Conflict) when the bit already has
    /// the requested value.
    fn set_flag_published(&self, env_id: i64, flag_key: &str, published: bool) -> Result<()>;
}

/// Trust: authorization authority for edge tokens.
///
/// Secrets are persisted only as hashes; lookup goes through the public
/// prefix and verification through the per-secret hash.
pub trait Trust: Send + Sync {
    /// Persist a new token. The plain secret never reaches the store.
    fn create_token(&self, token: NewToken) -> Result<crate::token::TokenRecord>;

    /// Deactivate a token. Tokens are create/revoke only.
    fn revoke_token(&self, token_id: i64) -> Result<()>;

    /// All active candidates sharing a public prefix (normally one).
    fn tokens_by_prefix(&self, prefix: &str) -> Result<Vec<crate::token::TokenRecord>>;

    /// Record token use. Callers coalesce; implementations must not be on
    /// any request's critical path.
    fn touch_last_used(&self, token_id: i64, at: Timestamp) -> Result<()>;
}

/// Input to [`Trust::create_token`].
#[derive(Debug, Clone)]
pub struct NewToken {
    pub env_id: i64,
    pub scope: crate::token::TokenScope,
    pub hashed_secret: String,
    pub prefix: String,
    pub expires_at: Option<Timestamp>,
}
