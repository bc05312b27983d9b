use serde::{Deserialize, Serialize};

use super::Timestamp;

/// Message pushed on the stream bus whenever published state changes.
///
/// Flag- and segment-scoped updates are optimization hints: subscribers may
/// invalidate just the targeted key. Environment-scoped updates require a
/// full invalidation for that environment. Heartbeats carry the current
/// version so idle subscribers still observe progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigUpdate {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub env_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_key: Option<String>,
    pub version: u64,
    pub timestamp: Timestamp,
}

/// Scope of a [`ConfigUpdate`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum UpdateKind {
    Flag,
    Segment,
    Environment,
    Heartbeat,
    Error,
}

impl ConfigUpdate {
    /// A whole-environment update; subscribers drop every cached entry for
    /// the environment.
    pub fn environment(env_key: impl Into<String>, version: u64, timestamp: Timestamp) -> Self {
        ConfigUpdate {
            kind: UpdateKind::Environment,
            env_key: env_key.into(),
            flag_key: None,
            version,
            timestamp,
        }
    }

    /// A single-flag update hint.
    pub fn flag(
        env_key: impl Into<String>,
        flag_key: impl Into<String>,
        version: u64,
        timestamp: Timestamp,
    ) -> Self {
        ConfigUpdate {
            kind: UpdateKind::Flag,
            env_key: env_key.into(),
            flag_key: Some(flag_key.into()),
            version,
            timestamp,
        }
    }

    /// Keep-alive carrying the current version.
    pub fn heartbeat(env_key: impl Into<String>, version: u64, timestamp: Timestamp) -> Self {
        ConfigUpdate {
            kind: UpdateKind::Heartbeat,
            env_key: env_key.into(),
            flag_key: None,
            version,
            timestamp,
        }
    }
}

/// Publishes [`ConfigUpdate`]s to whatever stream bus the host provides. The
/// edge implements this with per-environment broadcast channels.
pub trait UpdatePublisher: Send + Sync {
    #[allow(missing_docs)]
    fn publish(&self, update: ConfigUpdate);
}

/// Publisher that drops every update. Useful where no stream bus exists,
/// e.g., offline compilation in tests.
pub struct NoopPublisher;

impl UpdatePublisher for NoopPublisher {
    fn publish(&self, _update: ConfigUpdate) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn serializes_kind_as_type() {
        let update = ConfigUpdate::flag("prod", "checkout", 12, Utc::now());
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains(r#""type":"flag""#));
        assert!(json.contains(r#""flag_key":"checkout""#));

        let parsed: ConfigUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, update);
    }

    #[test]
    fn heartbeat_has_no_flag_key() {
        let json =
            serde_json::to_string(&ConfigUpdate::heartbeat("prod", 3, Utc::now())).unwrap();
        assert!(!json.contains("flag_key"));
    }
}
