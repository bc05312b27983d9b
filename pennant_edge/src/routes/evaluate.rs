//! `POST /evaluate` — the hot path.
//!
//! All flags of one request are evaluated against a single snapshot
//! version; the response carries that version so callers can reason about
//! linearizability. Non-default serves enqueue exposure records on the way
//! out, never blocking the response.
use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use pennant_core::bucketer::{self, EvaluationResult};
use pennant_core::events::ExposureEvent;
use pennant_core::snapshot::Timestamp;
use pennant_core::token::TokenScope;
use pennant_core::UserContext;

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub env_key: String,
    /// Specific flags to evaluate; omitted means every flag in the
    /// snapshot.
    #[serde(default)]
    pub flag_keys: Option<Vec<String>>,
    pub context: UserContext,
    #[serde(default)]
    #[allow(dead_code)]
    pub include_reason: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct EvaluateResponse {
    pub flags: BTreeMap<String, EvaluationResult>,
    pub config_version: u64,
    pub evaluated_at: Timestamp,
    pub request_id: String,
}

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EvaluateRequest>,
) -> Result<Json<EvaluateResponse>, ApiError> {
    let token = state.authenticate(&headers).await?;
    let environment = state.environment(&request.env_key).await?;
    state
        .auth
        .authorize(&token, &environment, TokenScope::Read)
        .map_err(ApiError::from)?;

    let snapshot = state.snapshot(&environment).await?;

    let flag_keys: Vec<String> = match request.flag_keys {
        Some(keys) => keys,
        None => snapshot.flags.keys().cloned().collect(),
    };

    let evaluated_at = Utc::now();
    let mut flags = BTreeMap::new();
    for flag_key in flag_keys {
        let result = bucketer::evaluate(&snapshot, &flag_key, &request.context);
        if let Some(exposure) = ExposureEvent::from_result(&result, &request.context, evaluated_at)
        {
            state.events.push_exposure(&exposure);
        }
        flags.insert(flag_key, result);
    }

    Ok(Json(EvaluateResponse {
        flags,
        config_version: snapshot.version,
        evaluated_at,
        request_id: format!("{:016x}", rand::random::<u64>()),
    }))
}
