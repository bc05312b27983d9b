use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use chrono::Utc;

use pennant_core::authoring::{AuthoringStore, EnvironmentRecord, Trust};
use pennant_core::cache::SnapshotCache;
use pennant_core::compiler;
use pennant_core::snapshot::EnvSnapshot;
use pennant_core::Error;

use crate::auth::{self, AuthedToken, Authenticator};
use crate::error::ApiError;
use crate::exposure::EventQueues;
use crate::snapshots::SnapshotResolver;
use crate::store::SqliteStore;
use crate::streams::{EdgePublisher, StreamHub};

/// Default interval between stream heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Everything a request handler needs. Cheap to clone; all fields are
/// shared.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub cache: Arc<dyn SnapshotCache>,
    pub resolver: Arc<SnapshotResolver>,
    pub hub: Arc<StreamHub>,
    pub publisher: Arc<EdgePublisher>,
    pub auth: Arc<Authenticator>,
    pub events: Arc<EventQueues>,
    pub heartbeat_interval: Duration,
}

impl AppState {
    pub fn new(
        store: Arc<SqliteStore>,
        cache: Arc<dyn SnapshotCache>,
        events: Arc<EventQueues>,
        heartbeat_interval: Duration,
    ) -> AppState {
        let authoring: Arc<dyn AuthoringStore> = store.clone();
        let trust: Arc<dyn Trust> = store.clone();
        let resolver = Arc::new(SnapshotResolver::new(authoring, cache.clone()));
        let hub = Arc::new(StreamHub::new());
        let publisher = Arc::new(EdgePublisher {
            hub: hub.clone(),
            resolver: resolver.clone(),
        });
        let auth = Arc::new(Authenticator::new(trust));

        AppState {
            store,
            cache,
            resolver,
            hub,
            publisher,
            auth,
            events,
            heartbeat_interval,
        }
    }

    /// Authenticate the request's bearer token. Verification is CPU-bound on
    /// cache miss, so it runs on the blocking pool; the `last_used_at` touch
    /// is detached and never delays the response.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthedToken, ApiError> {
        let Some(bearer) = auth::bearer_token(headers) else {
            return Err(ApiError::unauthorized());
        };

        let authenticator = self.auth.clone();
        let outcome = tokio::task::spawn_blocking(move || authenticator.authenticate(&bearer))
            .await
            .map_err(|err| ApiError::from(Error::Internal(format!("auth task failed: {err}"))))?
            .map_err(ApiError::from)?;

        if outcome.needs_touch {
            let trust = self.store.clone();
            let token_id = outcome.token.token_id;
            tokio::task::spawn_blocking(move || {
                if let Err(err) = trust.touch_last_used(token_id, Utc::now()) {
                    log::debug!(target: "pennant_edge",
                                token_id, error:display = err;
                                "failed to touch token last_used_at");
                }
            });
        }

        Ok(outcome.token)
    }

    /// Look an environment up by key, or by numeric id when the path segment
    /// parses as one.
    pub async fn environment(&self, key_or_id: &str) -> Result<EnvironmentRecord, ApiError> {
        let store = self.store.clone();
        let key_or_id = key_or_id.to_owned();
        tokio::task::spawn_blocking(move || match key_or_id.parse::<i64>() {
            Ok(env_id) => store.environment_by_id(env_id),
            Err(_) => store.environment_by_key(&key_or_id),
        })
        .await
        .map_err(|err| ApiError::from(Error::Internal(format!("store task failed: {err}"))))?
        .map_err(ApiError::from)
    }

    /// Current snapshot for an environment, cache-first with
    /// compile-on-miss.
    pub async fn snapshot(
        &self,
        environment: &EnvironmentRecord,
    ) -> Result<Arc<EnvSnapshot>, ApiError> {
        self.resolver
            .resolve(environment, self.publisher.clone())
            .await
            .map_err(ApiError::from)
    }

    /// Flip a flag's published bit and recompile the environment.
    pub async fn set_flag_published(
        &self,
        environment: EnvironmentRecord,
        flag_key: String,
        published: bool,
    ) -> Result<EnvSnapshot, ApiError> {
        let store = self.store.clone();
        let cache = self.cache.clone();
        let publisher = self.publisher.clone();

        tokio::task::spawn_blocking(move || {
            store.set_flag_published(environment.env_id, &flag_key, published)?;
            compiler::compile_and_publish(
                store.as_ref(),
                cache.as_ref(),
                publisher.as_ref(),
                environment.env_id,
                Some(&flag_key),
            )
        })
        .await
        .map_err(|err| ApiError::from(Error::Internal(format!("publish task failed: {err}"))))?
        .map_err(ApiError::from)
    }
}
