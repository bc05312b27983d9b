use std::path::PathBuf;
use std::time::Duration;

/// Configuration for [`Client`](crate::Client).
///
/// # Examples
/// ```
/// # use pennant_sdk::ClientConfig;
/// let config = ClientConfig::new("http://localhost:8787", "production", "ff_…")
///     .cache_size(5000)
///     .evaluation_timeout(std::time::Duration::from_millis(50))
///     .offline_path("/var/cache/pennant/production.json");
/// ```
pub struct ClientConfig {
    pub(crate) base_url: String,
    pub(crate) env_key: String,
    pub(crate) token: String,
    pub(crate) cache_size: usize,
    pub(crate) cache_ttl: Duration,
    pub(crate) evaluation_timeout: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) offline_path: Option<PathBuf>,
    pub(crate) batch_size: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) max_retries: u32,
}

impl ClientConfig {
    /// Create a configuration with the defaults: result cache of 1000
    /// entries with a 5 minute TTL, 100 ms evaluation timeout, 30 s
    /// heartbeats, event batches of 100 flushed every 10 s with 3 retries.
    pub fn new(
        base_url: impl Into<String>,
        env_key: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        ClientConfig {
            base_url: base_url.into(),
            env_key: env_key.into(),
            token: token.into(),
            cache_size: 1000,
            cache_ttl: Duration::from_secs(5 * 60),
            evaluation_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            offline_path: None,
            batch_size: 100,
            flush_interval: Duration::from_secs(10),
            max_retries: 3,
        }
    }

    /// Maximum entries in the result cache.
    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size.max(1);
        self
    }

    /// Time-to-live for cached evaluation results.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Upper bound on one evaluation's network time. On expiry the default
    /// value is returned with reason `error`.
    pub fn evaluation_timeout(mut self, timeout: Duration) -> Self {
        self.evaluation_timeout = timeout;
        self
    }

    /// Server heartbeat interval; the stream is considered unhealthy after
    /// three missed heartbeats.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Where to persist the offline snapshot. Without a path, offline
    /// fallback is disabled.
    pub fn offline_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.offline_path = Some(path.into());
        self
    }

    /// Events per forwarded batch.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Maximum time an event waits before its batch is flushed.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Delivery attempts per event batch before it is dropped.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}
