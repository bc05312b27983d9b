//! `GET /stream?environment=…` — long-lived config-update feed.
//!
//! Server-sent events: every `data:` line is a `ConfigUpdate`, with
//! heartbeats interleaved at a fixed interval so subscribers can detect
//! silent connections. A subscriber that falls more than the broadcast
//! backlog behind is disconnected and must reconnect.
use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use chrono::Utc;
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};

use pennant_core::snapshot::ConfigUpdate;
use pennant_core::token::TokenScope;

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub environment: String,
}

pub async fn handle(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let token = state.authenticate(&headers).await?;
    let environment = state.environment(&params.environment).await?;
    state
        .auth
        .authorize(&token, &environment, TokenScope::Read)
        .map_err(ApiError::from)?;

    log::info!(target: "pennant_edge",
               env_key:display = environment.env_key;
               "stream subscriber connected");

    let receiver = state.hub.subscribe(&environment.env_key);
    let subscriber_env = environment.env_key.clone();
    let updates = BroadcastStream::new(receiver).map(move |result| match result {
        Ok(update) => Some(update),
        Err(err) => {
            log::warn!(target: "pennant_edge",
                       env_key:display = subscriber_env,
                       error:display = err;
                       "stream subscriber fell behind the backlog; disconnecting");
            None
        }
    });

    let resolver = state.resolver.clone();
    let env_key = environment.env_key.clone();
    let fallback_version = environment.version;
    let interval = tokio::time::interval_at(
        tokio::time::Instant::now() + state.heartbeat_interval,
        state.heartbeat_interval,
    );
    let heartbeats = IntervalStream::new(interval).map(move |_| {
        let version = resolver.current_version(&env_key).unwrap_or(fallback_version);
        Some(ConfigUpdate::heartbeat(env_key.clone(), version, Utc::now()))
    });

    // `None` marks a lagged subscriber. The cut must end the merged stream,
    // not just the updates half — otherwise the heartbeat side would keep
    // the response open forever and the client would never reconnect and
    // re-sync.
    let stream = futures::stream::select(updates, heartbeats)
        .take_while(|update| futures::future::ready(update.is_some()))
        .filter_map(|update| futures::future::ready(update))
        .map(|update| {
            let data = serde_json::to_string(&update).unwrap_or_else(|_| "{}".to_owned());
            Ok(Event::default().data(data))
        });

    Ok(Sse::new(stream))
}
