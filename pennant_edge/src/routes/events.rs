//! `POST /events/{kind}` — event ingestion.
//!
//! Accepts a batch, enqueues it for the Event Sink, and answers 202. The
//! response is unconditional once the batch is on the queue; delivery is
//! the forwarder's problem.
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use pennant_core::events::{EventBatch, EventKind};
use pennant_core::token::TokenScope;

use crate::error::ApiError;
use crate::AppState;

pub async fn handle(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Json(batch): Json<EventBatch>,
) -> Result<impl IntoResponse, ApiError> {
    let token = state.authenticate(&headers).await?;
    if !token.scope.allows(TokenScope::Read) {
        return Err(ApiError::forbidden("token cannot submit events"));
    }

    let kind = EventKind::parse(&kind)
        .ok_or_else(|| ApiError::bad_request(format!("unknown event kind: {kind}")))?;

    // The header duplicates the body's batch id so proxies and the sink can
    // dedupe without parsing the payload; a mismatch is a malformed request.
    if let Some(header_id) = headers.get("x-batch-id").and_then(|v| v.to_str().ok()) {
        if header_id != batch.batch_id {
            return Err(ApiError::bad_request("X-Batch-ID does not match batch_id"));
        }
    }

    let accepted = batch.events.len();
    state.events.push(kind, batch.events);

    Ok((
        StatusCode::ACCEPTED,
        [("x-batch-id", batch.batch_id.clone())],
        Json(json!({ "accepted": accepted, "batch_id": batch.batch_id })),
    ))
}
