//! Environment snapshots: the atomic publishable unit.
//!
//! An [`EnvSnapshot`] bundles every published flag and segment of one
//! environment, stamped with the environment's monotonic version and salt.
//! Snapshots are written once and superseded, never mutated. Canonical
//! serialization (sorted maps, fixed field order) makes two snapshots with
//! equal `(env_key, version)` byte-equivalent, which is what the ETag
//! machinery relies on.
mod canonical;
mod models;
mod update;

pub use canonical::compute_etag;
pub use models::*;
pub use update::{ConfigUpdate, NoopPublisher, UpdateKind, UpdatePublisher};
