//! `GET /configs/{env_key}` — serve the current snapshot with ETag
//! validation.
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use pennant_core::token::TokenScope;

use crate::error::ApiError;
use crate::AppState;

pub async fn handle(
    State(state): State<AppState>,
    Path(env_key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = state.authenticate(&headers).await?;
    let environment = state.environment(&env_key).await?;
    state
        .auth
        .authorize(&token, &environment, TokenScope::Read)
        .map_err(ApiError::from)?;

    let snapshot = state.snapshot(&environment).await?;
    let etag = format!("\"{}\"", snapshot.etag);

    if let Some(candidate) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        if candidate.trim().trim_matches('"') == snapshot.etag {
            return Ok((StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response());
        }
    }

    let body = snapshot.canonical_bytes().map_err(ApiError::from)?;
    Ok((
        StatusCode::OK,
        [
            (header::ETAG, etag),
            (header::CONTENT_TYPE, "application/json".to_owned()),
        ],
        body,
    )
        .into_response())
}
