//! Exposure, metric, and custom events, plus the sink contract.
//!
//! Events are strictly best-effort: evaluation correctness is never allowed
//! to wait on ingestion, and queues drop under backpressure rather than
//! block.
use serde::{Deserialize, Serialize};

use crate::bucketer::{EvaluationReason, EvaluationResult};
use crate::snapshot::{Timestamp, Value};
use crate::{Result, UserContext};

/// The three ingestion lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum EventKind {
    Exposure,
    Metric,
    Custom,
}

impl EventKind {
    /// Path segment used by `POST /events/{kind}`.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Exposure => "exposure",
            EventKind::Metric => "metric",
            EventKind::Custom => "custom",
        }
    }

    #[allow(missing_docs)]
    pub fn parse(s: &str) -> Option<EventKind> {
        match s {
            "exposure" => Some(EventKind::Exposure),
            "metric" => Some(EventKind::Metric),
            "custom" => Some(EventKind::Custom),
            _ => None,
        }
    }
}

/// Record that a specific user was served a specific non-default variation.
///
/// Emitted at most once per evaluation that actually served a non-default;
/// ordering across events is not promised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureEvent {
    pub timestamp: Timestamp,
    pub user_key: String,
    pub flag_key: String,
    pub variation_key: String,
    pub value: Value,
    pub reason: EvaluationReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Experiment tag, when the serving rule belongs to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment: Option<String>,
}

impl ExposureEvent {
    /// Build the exposure record for a served result. Returns `None` for
    /// evaluations that served the default — those are not exposures.
    pub fn from_result(
        result: &EvaluationResult,
        user: &UserContext,
        timestamp: Timestamp,
    ) -> Option<ExposureEvent> {
        if !result.served_non_default() {
            return None;
        }
        Some(ExposureEvent {
            timestamp,
            user_key: user.user_key.clone(),
            flag_key: result.flag_key.clone(),
            variation_key: result.variation_key.clone(),
            value: result.value.clone(),
            reason: result.reason,
            session_id: user.session_id.clone(),
            experiment: result.rule_id.clone(),
        })
    }
}

/// One ingestion batch as accepted by `POST /events/{kind}`.
///
/// `batch_id` doubles as the `X-Batch-ID` header for server-side
/// idempotency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<serde_json::Value>,
    pub timestamp: Timestamp,
    pub batch_id: String,
}

/// Downstream ingestion collaborator. Implementations own their retries;
/// callers treat a returned error as "this batch did not land".
pub trait EventSink: Send + Sync {
    #[allow(missing_docs)]
    fn submit(&self, kind: EventKind, batch: &EventBatch) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::bucketer::EvaluationReason;

    fn result(reason: EvaluationReason) -> EvaluationResult {
        EvaluationResult {
            flag_key: "f".to_owned(),
            variation_key: "on".to_owned(),
            value: true.into(),
            reason,
            rule_id: Some("r1".to_owned()),
            bucket: 42,
            bucketing_id: 7,
        }
    }

    #[test]
    fn only_non_default_serves_produce_exposures() {
        let user = UserContext::new("alice");
        assert!(
            ExposureEvent::from_result(&result(EvaluationReason::RuleMatch), &user, Utc::now())
                .is_some()
        );
        assert!(
            ExposureEvent::from_result(&result(EvaluationReason::Rollout), &user, Utc::now())
                .is_some()
        );
        for reason in [
            EvaluationReason::Off,
            EvaluationReason::Default,
            EvaluationReason::Error,
            EvaluationReason::Offline,
        ] {
            assert!(ExposureEvent::from_result(&result(reason), &user, Utc::now()).is_none());
        }
    }

    #[test]
    fn kind_round_trips_through_path_segment() {
        for kind in [EventKind::Exposure, EventKind::Metric, EventKind::Custom] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("telemetry"), None);
    }
}
