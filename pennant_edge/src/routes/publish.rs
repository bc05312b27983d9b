//! Publish/unpublish transitions — the only authoring verbs the edge owns.
//!
//! Flipping the bit triggers a full recompilation of the environment; the
//! stream notification is flag-scoped so subscribers can invalidate
//! narrowly. Requires a write-scope token bound to the target environment.
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use pennant_core::token::TokenScope;

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub env_key: String,
    pub flag_key: String,
    pub published: bool,
    pub version: u64,
}

pub async fn publish(
    state: State<AppState>,
    path: Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Json<PublishResponse>, ApiError> {
    transition(state, path, headers, true).await
}

pub async fn unpublish(
    state: State<AppState>,
    path: Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Json<PublishResponse>, ApiError> {
    transition(state, path, headers, false).await
}

async fn transition(
    State(state): State<AppState>,
    Path((_org, _project, env_key, flag_key)): Path<(String, String, String, String)>,
    headers: HeaderMap,
    published: bool,
) -> Result<Json<PublishResponse>, ApiError> {
    let token = state.authenticate(&headers).await?;
    let environment = state.environment(&env_key).await?;
    state
        .auth
        .authorize(&token, &environment, TokenScope::Write)
        .map_err(ApiError::from)?;

    let snapshot = state
        .set_flag_published(environment.clone(), flag_key.clone(), published)
        .await?;

    log::info!(target: "pennant_edge",
               env_key:display = environment.env_key,
               flag_key,
               published,
               version = snapshot.version;
               "flag publish transition");

    Ok(Json(PublishResponse {
        env_key: environment.env_key,
        flag_key,
        published,
        version: snapshot.version,
    }))
}
