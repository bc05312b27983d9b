//! HTTP surface of the edge evaluator.
use axum::routing::{get, post};
use axum::Router;

use crate::AppState;

pub mod configs;
pub mod evaluate;
pub mod events;
pub mod publish;
pub mod stream;

/// Build the router. Paths are the public contract; handlers stay thin and
/// push the work into [`AppState`].
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/evaluate", post(evaluate::handle))
        .route("/configs/{env_key}", get(configs::handle))
        .route("/stream", get(stream::handle))
        .route("/events/{kind}", post(events::handle))
        .route(
            "/orgs/{org}/projects/{project}/environments/{env_key}/flags/{flag_key}/publish",
            post(publish::publish),
        )
        .route(
            "/orgs/{org}/projects/{project}/environments/{env_key}/flags/{flag_key}/unpublish",
            post(publish::unpublish),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
