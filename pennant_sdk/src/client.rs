use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;

use pennant_core::bucketer::{self, EvaluationReason, EvaluationResult};
use pennant_core::events::{EventKind, ExposureEvent};
use pennant_core::snapshot::Value;
use pennant_core::{Error, UserContext};

use crate::config::ClientConfig;
use crate::events::{EventForwarder, ForwarderOptions, ForwarderStats};
use crate::offline::OfflineStore;
use crate::result_cache::ResultCache;
use crate::stream::{StreamShared, StreamStatus, StreamSubscriber};
use crate::transport::{EdgeApi, HttpTransport};

/// Snapshot of the runtime's observable state.
#[derive(Debug, Clone, Copy)]
pub struct SdkStatus {
    pub stream: StreamStatus,
    /// Last config version committed to the local caches.
    pub config_version: u64,
    pub events: ForwarderStats,
}

/// Result of [`Client::evaluate_multiple`]: every flag evaluated against a
/// single snapshot version.
#[derive(Debug)]
pub struct BatchEvaluation {
    pub flags: HashMap<String, EvaluationResult>,
    /// Version the misses were evaluated at; `None` when everything came
    /// from cache or fallback.
    pub config_version: Option<u64>,
}

/// A client for the Pennant edge evaluator.
///
/// Create one with [`ClientConfig`], then call [`Client::start_stream`] so
/// the runtime mirrors server updates. All evaluation entry points follow
/// the same contract: they never panic across the boundary and return the
/// caller-supplied default with reason `error` when anything goes wrong.
pub struct Client {
    env_key: String,
    transport: Arc<dyn EdgeApi>,
    cache: Arc<ResultCache>,
    shared: Arc<StreamShared>,
    offline: Option<Arc<OfflineStore>>,
    forwarder: Option<EventForwarder>,
    subscriber: Option<StreamSubscriber>,
    offline_mode: AtomicBool,
    evaluation_timeout: std::time::Duration,
}

impl Client {
    /// Create a client over HTTP.
    pub fn new(config: ClientConfig) -> pennant_core::Result<Client> {
        let transport = Arc::new(HttpTransport::new(
            &config.base_url,
            config.token.clone(),
            config.heartbeat_interval,
        )?);
        Ok(Self::with_transport(config, transport))
    }

    /// Create a client over any transport. This is the seam the tests use.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn EdgeApi>) -> Client {
        let cache = Arc::new(ResultCache::new(config.cache_size, config.cache_ttl));
        let offline = config.offline_path.as_ref().map(|path| {
            Arc::new(OfflineStore::new(path.clone()))
        });
        let forwarder = EventForwarder::start(
            transport.clone(),
            ForwarderOptions {
                batch_size: config.batch_size,
                flush_interval: config.flush_interval,
                max_retries: config.max_retries,
                retry_backoff: std::time::Duration::from_millis(500),
            },
        )
        .map_err(|err| {
            log::error!(target: "pennant_sdk", error:display = err;
                        "failed to start event forwarder; events disabled");
            err
        })
        .ok();

        Client {
            env_key: config.env_key,
            transport,
            cache,
            shared: Arc::new(StreamShared::new()),
            offline,
            forwarder,
            subscriber: None,
            offline_mode: AtomicBool::new(false),
            evaluation_timeout: config.evaluation_timeout,
        }
    }

    /// Start the streaming subscriber.
    ///
    /// Without it the client still works, but invalidation degrades to the
    /// result cache's TTL.
    pub fn start_stream(&mut self) {
        if self.subscriber.is_some() {
            return;
        }
        match StreamSubscriber::start(
            self.transport.clone(),
            self.env_key.clone(),
            self.cache.clone(),
            self.shared.clone(),
            self.offline.clone(),
        ) {
            Ok(subscriber) => self.subscriber = Some(subscriber),
            Err(err) => {
                log::error!(target: "pennant_sdk", error:display = err;
                            "failed to start stream subscriber");
            }
        }
    }

    /// Evaluate one flag. Non-blocking on cache hit; at most one network
    /// request on miss. Failure order: cache, offline snapshot, default.
    pub fn evaluate(&self, flag_key: &str, user: &UserContext, default: Value) -> EvaluationResult {
        if let Some(hit) = self.cache.get(flag_key, &user.user_key) {
            return hit;
        }

        if self.offline_mode.load(Ordering::Relaxed) {
            return self.evaluate_offline(flag_key, user, default);
        }

        let keys = [flag_key.to_owned()];
        match self
            .transport
            .evaluate(&self.env_key, user, &keys, self.evaluation_timeout)
        {
            Ok(outcome) => {
                self.shared.commit_version(outcome.config_version);
                let mut wanted = None;
                for (key, result) in outcome.flags {
                    if key == flag_key {
                        wanted = Some(result.clone());
                    }
                    self.cache.put(result, &user.user_key);
                }
                wanted.unwrap_or_else(|| defaulted(flag_key, default, EvaluationReason::Error))
            }
            Err(err @ Error::Internal(_)) => {
                // Malformed server response: drop whatever we may have held
                // for this entry and fail closed.
                log::warn!(target: "pennant_sdk", flag_key, error:display = err;
                           "malformed evaluate response");
                self.cache.invalidate(flag_key, &user.user_key);
                defaulted(flag_key, default, EvaluationReason::Error)
            }
            Err(err) => {
                log::debug!(target: "pennant_sdk", flag_key, error:display = err;
                            "evaluate request failed; trying offline snapshot");
                self.evaluate_offline(flag_key, user, default)
            }
        }
    }

    /// Evaluate many flags at once. All cache misses are coalesced into a
    /// single request and answered from one snapshot version.
    pub fn evaluate_multiple(
        &self,
        flag_keys: &[String],
        user: &UserContext,
    ) -> BatchEvaluation {
        let mut flags = HashMap::new();
        let mut misses = Vec::new();
        for flag_key in flag_keys {
            match self.cache.get(flag_key, &user.user_key) {
                Some(hit) => {
                    flags.insert(flag_key.clone(), hit);
                }
                None => misses.push(flag_key.clone()),
            }
        }

        let mut config_version = None;
        if !misses.is_empty() {
            if self.offline_mode.load(Ordering::Relaxed) {
                for flag_key in &misses {
                    flags.insert(
                        flag_key.clone(),
                        self.evaluate_offline(flag_key, user, Value::null()),
                    );
                }
            } else {
                match self.transport.evaluate(
                    &self.env_key,
                    user,
                    &misses,
                    self.evaluation_timeout,
                ) {
                    Ok(outcome) => {
                        self.shared.commit_version(outcome.config_version);
                        config_version = Some(outcome.config_version);
                        for (key, result) in outcome.flags {
                            self.cache.put(result.clone(), &user.user_key);
                            flags.insert(key, result);
                        }
                    }
                    Err(err) => {
                        log::debug!(target: "pennant_sdk", error:display = err;
                                    "batch evaluate failed; trying offline snapshot");
                        for flag_key in &misses {
                            flags.insert(
                                flag_key.clone(),
                                self.evaluate_offline(flag_key, user, Value::null()),
                            );
                        }
                    }
                }
            }
        }

        BatchEvaluation {
            flags,
            config_version,
        }
    }

    /// Boolean flag with a typed default.
    pub fn boolean_value(&self, flag_key: &str, user: &UserContext, default: bool) -> bool {
        self.evaluate(flag_key, user, default.into())
            .value
            .as_boolean()
            .unwrap_or(default)
    }

    /// String flag with a typed default.
    pub fn string_value(&self, flag_key: &str, user: &UserContext, default: &str) -> String {
        self.evaluate(flag_key, user, default.into())
            .value
            .as_str()
            .map(str::to_owned)
            .unwrap_or_else(|| default.to_owned())
    }

    /// Numeric flag with a typed default.
    pub fn number_value(&self, flag_key: &str, user: &UserContext, default: f64) -> f64 {
        self.evaluate(flag_key, user, default.into())
            .value
            .as_number()
            .unwrap_or(default)
    }

    /// JSON flag with a typed default.
    pub fn json_value(
        &self,
        flag_key: &str,
        user: &UserContext,
        default: serde_json::Value,
    ) -> serde_json::Value {
        let result = self.evaluate(flag_key, user, Value::Json(default.clone()));
        match result.value {
            Value::Json(value) => value,
            other => serde_json::to_value(&other).unwrap_or(default),
        }
    }

    /// Queue a metric event for the edge.
    pub fn track_metric(&self, event: serde_json::Value) {
        if let Some(forwarder) = &self.forwarder {
            forwarder.track(EventKind::Metric, event);
        }
    }

    /// Queue a custom event for the edge.
    pub fn track_custom(&self, event: serde_json::Value) {
        if let Some(forwarder) = &self.forwarder {
            forwarder.track(EventKind::Custom, event);
        }
    }

    /// Enter or leave explicit offline mode. While offline, evaluation goes
    /// straight to the persisted snapshot.
    pub fn set_offline(&self, offline: bool) {
        self.offline_mode.store(offline, Ordering::Relaxed);
    }

    /// Observable runtime state.
    pub fn status(&self) -> SdkStatus {
        SdkStatus {
            stream: self.shared.status(),
            config_version: self.shared.committed_version(),
            events: self
                .forwarder
                .as_ref()
                .map(|f| f.stats())
                .unwrap_or_default(),
        }
    }

    /// Stop the background work: the subscriber exits and the forwarder
    /// drains once with a bounded deadline.
    pub fn close(mut self) {
        if let Some(subscriber) = self.subscriber.take() {
            subscriber.stop();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.close();
        }
    }

    fn evaluate_offline(
        &self,
        flag_key: &str,
        user: &UserContext,
        default: Value,
    ) -> EvaluationResult {
        let Some(snapshot) = self.offline.as_ref().and_then(|store| store.load()) else {
            return defaulted(flag_key, default, EvaluationReason::Error);
        };

        let mut result = bucketer::evaluate(&snapshot, flag_key, user);
        if result.reason == EvaluationReason::Error {
            result.value = default;
            return result;
        }

        // The server never saw this serve; record the exposure ourselves.
        if result.served_non_default() {
            if let (Some(forwarder), Some(exposure)) = (
                &self.forwarder,
                ExposureEvent::from_result(&result, user, Utc::now()),
            ) {
                if let Ok(event) = serde_json::to_value(&exposure) {
                    forwarder.track(EventKind::Exposure, event);
                }
            }
        }

        result.reason = EvaluationReason::Offline;
        result
    }
}

fn defaulted(flag_key: &str, default: Value, reason: EvaluationReason) -> EvaluationResult {
    EvaluationResult {
        flag_key: flag_key.to_owned(),
        variation_key: String::new(),
        value: default,
        reason,
        rule_id: None,
        bucket: 0,
        bucketing_id: 0,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::BufRead;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    use pennant_core::events::EventBatch;
    use pennant_core::snapshot::{
        EnvSnapshot, FlagConfig, FlagStatus, FlagType, TryParse, Variation,
    };

    use crate::transport::EvaluateOutcome;

    use super::*;

    #[derive(Default)]
    struct MockTransport {
        evaluate_calls: AtomicUsize,
        /// Results served per flag; `None` entries simulate a network
        /// failure for the whole call.
        responses: Mutex<Vec<Option<EvaluateOutcome>>>,
        snapshot: Mutex<Option<EnvSnapshot>>,
        malformed: AtomicBool,
    }

    impl MockTransport {
        fn respond_with(&self, flags: Vec<EvaluationResult>, version: u64) {
            self.responses.lock().unwrap().push(Some(EvaluateOutcome {
                flags: flags
                    .into_iter()
                    .map(|r| (r.flag_key.clone(), r))
                    .collect(),
                config_version: version,
            }));
        }

        fn fail_next(&self) {
            self.responses.lock().unwrap().push(None);
        }
    }

    impl EdgeApi for MockTransport {
        fn evaluate(
            &self,
            _env_key: &str,
            _context: &UserContext,
            flag_keys: &[String],
            _timeout: Duration,
        ) -> pennant_core::Result<EvaluateOutcome> {
            self.evaluate_calls.fetch_add(1, Ordering::SeqCst);
            if self.malformed.load(Ordering::SeqCst) {
                return Err(Error::Internal("malformed evaluate response".to_owned()));
            }
            let mut responses = self.responses.lock().unwrap();
            match responses.pop() {
                Some(Some(mut outcome)) => {
                    outcome.flags.retain(|key, _| flag_keys.contains(key));
                    Ok(outcome)
                }
                Some(None) | None => Err(Error::Unavailable("no route".to_owned())),
            }
        }

        fn fetch_snapshot(&self, _env_key: &str) -> pennant_core::Result<EnvSnapshot> {
            self.snapshot
                .lock()
                .unwrap()
                .clone()
                .ok_or(Error::NotFound("snapshot"))
        }

        fn submit_events(
            &self,
            _kind: EventKind,
            _batch: &EventBatch,
        ) -> pennant_core::Result<()> {
            Ok(())
        }

        fn open_stream(&self, _env_key: &str) -> pennant_core::Result<Box<dyn BufRead + Send>> {
            Err(Error::Unavailable("no stream in tests".to_owned()))
        }
    }

    fn config() -> ClientConfig {
        ClientConfig::new("http://localhost", "prod", "ff_test")
            .flush_interval(Duration::from_secs(3600))
    }

    fn served(flag: &str, variation: &str, value: impl Into<Value>) -> EvaluationResult {
        EvaluationResult {
            flag_key: flag.to_owned(),
            variation_key: variation.to_owned(),
            value: value.into(),
            reason: EvaluationReason::RuleMatch,
            rule_id: Some("r".to_owned()),
            bucket: 5,
            bucketing_id: 5,
        }
    }

    #[test]
    fn cache_hit_skips_the_network() {
        let _ = env_logger::builder().is_test(true).try_init();

        let transport = Arc::new(MockTransport::default());
        transport.respond_with(vec![served("f", "on", true)], 4);
        let client = Client::with_transport(config(), transport.clone());
        let user = UserContext::new("alice");

        let first = client.evaluate("f", &user, false.into());
        assert_eq!(first.variation_key, "on");
        assert_eq!(transport.evaluate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.status().config_version, 4);

        // At most one request per miss: the second call is a hit.
        let second = client.evaluate("f", &user, false.into());
        assert_eq!(second.variation_key, "on");
        assert_eq!(transport.evaluate_calls.load(Ordering::SeqCst), 1);
        client.close();
    }

    #[test]
    fn network_failure_without_offline_serves_default() {
        let transport = Arc::new(MockTransport::default());
        transport.fail_next();
        let client = Client::with_transport(config(), transport);
        let user = UserContext::new("alice");

        let result = client.evaluate("f", &user, Value::String("fallback".to_owned()));
        assert_eq!(result.reason, EvaluationReason::Error);
        assert_eq!(result.value.as_str(), Some("fallback"));
        client.close();
    }

    #[test]
    fn network_failure_falls_back_to_offline_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prod.json");

        let flag = FlagConfig {
            key: "f".to_owned(),
            flag_type: FlagType::Boolean,
            status: FlagStatus::Active,
            default_variation_key: "on".to_owned(),
            variations: BTreeMap::from([(
                "on".to_owned(),
                Variation {
                    key: "on".to_owned(),
                    value: true.into(),
                    name: None,
                    description: None,
                },
            )]),
            rules: vec![],
            traffic_allocation: 1.0,
        };
        let snapshot = EnvSnapshot {
            env_key: "prod".to_owned(),
            version: 9,
            salt: "s".to_owned(),
            updated_at: Utc::now(),
            etag: "e".to_owned(),
            flags: BTreeMap::from([("f".to_owned(), TryParse::Parsed(flag))]),
            segments: BTreeMap::new(),
        };
        OfflineStore::new(&path).save(&snapshot).unwrap();

        let transport = Arc::new(MockTransport::default());
        transport.fail_next();
        let client =
            Client::with_transport(config().offline_path(&path), transport);
        let user = UserContext::new("alice");

        let result = client.evaluate("f", &user, false.into());
        assert_eq!(result.reason, EvaluationReason::Offline);
        assert_eq!(result.value, Value::Boolean(true));
        client.close();
    }

    #[test]
    fn malformed_response_serves_default_and_invalidates() {
        let transport = Arc::new(MockTransport::default());
        let client = Client::with_transport(config(), transport.clone());
        let user = UserContext::new("alice");

        transport.malformed.store(true, Ordering::SeqCst);
        let result = client.evaluate("f", &user, false.into());
        assert_eq!(result.reason, EvaluationReason::Error);
        assert_eq!(result.value, Value::Boolean(false));

        // Recovery: the next call goes back to the network.
        transport.malformed.store(false, Ordering::SeqCst);
        transport.respond_with(vec![served("f", "on", true)], 2);
        let healed = client.evaluate("f", &user, false.into());
        assert_eq!(healed.variation_key, "on");
        client.close();
    }

    #[test]
    fn evaluate_multiple_coalesces_misses() {
        let transport = Arc::new(MockTransport::default());
        transport.respond_with(vec![served("a", "on", true)], 3);
        let client = Client::with_transport(config(), transport.clone());
        let user = UserContext::new("alice");

        // Seed "a" into the cache; "b" and "c" stay cold.
        client.evaluate("a", &user, false.into());
        assert_eq!(transport.evaluate_calls.load(Ordering::SeqCst), 1);

        transport.respond_with(
            vec![served("b", "on", true), served("c", "off", false)],
            3,
        );
        let batch = client.evaluate_multiple(
            &["a".to_owned(), "b".to_owned(), "c".to_owned()],
            &user,
        );

        // One request for the two misses, none for the hit.
        assert_eq!(transport.evaluate_calls.load(Ordering::SeqCst), 2);
        assert_eq!(batch.flags.len(), 3);
        assert_eq!(batch.config_version, Some(3));
        client.close();
    }

    #[test]
    fn explicit_offline_mode_never_touches_the_network() {
        let transport = Arc::new(MockTransport::default());
        let client = Client::with_transport(config(), transport.clone());
        client.set_offline(true);

        let result = client.evaluate("f", &UserContext::new("u"), false.into());
        assert_eq!(result.reason, EvaluationReason::Error);
        assert_eq!(transport.evaluate_calls.load(Ordering::SeqCst), 0);
        client.close();
    }

    #[test]
    fn typed_accessors_return_defaults_on_error() {
        let transport = Arc::new(MockTransport::default());
        let client = Client::with_transport(config(), transport);

        let user = UserContext::new("u");
        assert!(!client.boolean_value("f", &user, false));
        assert_eq!(client.string_value("g", &user, "fallback"), "fallback");
        assert_eq!(client.number_value("h", &user, 2.5), 2.5);
        assert_eq!(
            client.json_value("i", &user, serde_json::json!({"a": 1})),
            serde_json::json!({"a": 1})
        );
        client.close();
    }
}
