//! Streaming subscriber: the SDK's mirror of server state.
//!
//! A background thread holds the `/stream` connection, parses
//! `ConfigUpdate` lines, and invalidates the result cache accordingly:
//! flag-scoped updates drop one flag, segment- and environment-scoped ones
//! drop everything. The committed config version only ever moves forward.
//!
//! Reconnection uses jittered exponential backoff (1 s initial, 30 s cap)
//! that resets once a connection delivers an update. The transport bounds
//! silence between reads to three heartbeat intervals, so a dead connection
//! surfaces as a read error and lands back in the reconnect path.
use std::io::BufRead;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use pennant_core::snapshot::{ConfigUpdate, UpdateKind};

use crate::offline::OfflineStore;
use crate::result_cache::ResultCache;
use crate::transport::EdgeApi;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum StreamStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// State shared between the subscriber thread and the client.
pub(crate) struct StreamShared {
    status: Mutex<StreamStatus>,
    committed_version: AtomicU64,
}

impl StreamShared {
    pub fn new() -> StreamShared {
        StreamShared {
            status: Mutex::new(StreamStatus::Disconnected),
            committed_version: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.lock().expect("stream status lock poisoned")
    }

    fn set_status(&self, status: StreamStatus) {
        *self.status.lock().expect("stream status lock poisoned") = status;
    }

    /// Last config version committed to the local caches.
    pub fn committed_version(&self) -> u64 {
        self.committed_version.load(Ordering::Acquire)
    }

    /// Advance monotonically; stale versions are ignored.
    pub fn commit_version(&self, version: u64) {
        self.committed_version.fetch_max(version, Ordering::AcqRel);
    }
}

/// Apply one update to the local mirror. Also used by the client when an
/// evaluate response reveals a version.
pub(crate) fn apply_update(
    update: &ConfigUpdate,
    cache: &ResultCache,
    shared: &StreamShared,
    offline: Option<&OfflineStore>,
    transport: Option<&dyn EdgeApi>,
    env_key: &str,
) {
    match update.kind {
        UpdateKind::Flag => {
            if let Some(flag_key) = &update.flag_key {
                cache.invalidate_flag(flag_key);
            }
            shared.commit_version(update.version);
        }
        UpdateKind::Segment | UpdateKind::Environment => {
            // Segment membership can affect any flag; both scopes clear
            // everything.
            cache.clear();
            if let (Some(offline), Some(transport)) = (offline, transport) {
                refresh_offline(offline, transport, env_key);
            }
            shared.commit_version(update.version);
        }
        UpdateKind::Heartbeat => {
            // A heartbeat only proves liveness; its version is not an
            // invalidation. One ahead of what we have committed means
            // updates were missed (reconnect gap, dropped backlog), so
            // resync instead of silently advancing the counter.
            if update.version > shared.committed_version() {
                log::warn!(target: "pennant_sdk",
                           env_key:display = update.env_key,
                           version = update.version;
                           "heartbeat is ahead of committed state; resyncing");
                cache.clear();
                if let (Some(offline), Some(transport)) = (offline, transport) {
                    refresh_offline(offline, transport, env_key);
                }
                shared.commit_version(update.version);
            }
        }
        UpdateKind::Error => {
            log::warn!(target: "pennant_sdk",
                       env_key:display = update.env_key;
                       "server reported a stream error");
        }
    }
}

fn refresh_offline(offline: &OfflineStore, transport: &dyn EdgeApi, env_key: &str) {
    match transport.fetch_snapshot(env_key) {
        Ok(snapshot) => {
            if let Err(err) = offline.save(&snapshot) {
                log::warn!(target: "pennant_sdk", error:display = err;
                           "failed to persist offline snapshot");
            }
        }
        Err(err) => {
            log::debug!(target: "pennant_sdk", error:display = err;
                        "offline snapshot refresh failed");
        }
    }
}

/// Parse one stream line. Accepts both bare line-delimited JSON and SSE
/// `data:` framing; everything else (comments, `event:` headers, blanks) is
/// ignored.
pub(crate) fn parse_stream_line(line: &str) -> Option<ConfigUpdate> {
    let line = line.trim();
    let payload = line.strip_prefix("data:").unwrap_or(line).trim();
    if payload.is_empty() || !payload.starts_with('{') {
        return None;
    }
    match serde_json::from_str(payload) {
        Ok(update) => Some(update),
        Err(err) => {
            log::warn!(target: "pennant_sdk", error:display = err;
                       "ignoring malformed stream message");
            None
        }
    }
}

/// Next reconnect delay: exponential with jitter, capped.
pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

fn jittered(base: Duration) -> Duration {
    base + rand::thread_rng().gen_range(Duration::ZERO..=base / 4)
}

/// The subscriber thread handle.
pub(crate) struct StreamSubscriber {
    stop_sender: mpsc::Sender<()>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl StreamSubscriber {
    pub fn start(
        transport: Arc<dyn EdgeApi>,
        env_key: String,
        cache: Arc<ResultCache>,
        shared: Arc<StreamShared>,
        offline: Option<Arc<OfflineStore>>,
    ) -> std::io::Result<StreamSubscriber> {
        let (stop_sender, stop_receiver) = mpsc::channel::<()>();

        let join_handle = std::thread::Builder::new()
            .name("pennant-sdk-stream".to_owned())
            .spawn(move || {
                let mut backoff = INITIAL_BACKOFF;
                let mut first_attempt = true;

                loop {
                    shared.set_status(if first_attempt {
                        StreamStatus::Connecting
                    } else {
                        StreamStatus::Reconnecting
                    });

                    match transport.open_stream(&env_key) {
                        Ok(reader) => {
                            shared.set_status(StreamStatus::Connected);
                            log::info!(target: "pennant_sdk",
                                       env_key:display = env_key;
                                       "config stream connected");

                            // Anything published while we were away is
                            // invisible to the stream: drop cached results
                            // and refresh the offline mirror before
                            // resuming, rather than serving stale entries
                            // until their TTL runs out.
                            cache.clear();
                            if let Some(offline) = &offline {
                                refresh_offline(offline, transport.as_ref(), &env_key);
                            }

                            let delivered = read_updates(
                                reader,
                                &stop_receiver,
                                &cache,
                                &shared,
                                offline.as_deref(),
                                transport.as_ref(),
                                &env_key,
                            );
                            match delivered {
                                ReadOutcome::Stopped => {
                                    shared.set_status(StreamStatus::Disconnected);
                                    return;
                                }
                                ReadOutcome::Delivered => backoff = INITIAL_BACKOFF,
                                ReadOutcome::Silent => {}
                            }
                            shared.set_status(StreamStatus::Reconnecting);
                        }
                        Err(err) => {
                            shared.set_status(StreamStatus::Error);
                            log::warn!(target: "pennant_sdk",
                                       env_key:display = env_key,
                                       error:display = err;
                                       "config stream connection failed");
                        }
                    }
                    first_attempt = false;

                    match stop_receiver.recv_timeout(jittered(backoff)) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) => {
                            shared.set_status(StreamStatus::Disconnected);
                            return;
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            std::thread::sleep(backoff);
                        }
                    }
                    backoff = next_backoff(backoff);
                }
            })?;

        Ok(StreamSubscriber {
            stop_sender,
            join_handle: Some(join_handle),
        })
    }

    /// Ask the thread to stop. Does not wait for it to exit; the thread may
    /// be blocked in a read for up to the transport's silence bound.
    pub fn stop(&self) {
        let _ = self.stop_sender.send(());
    }
}

impl Drop for StreamSubscriber {
    fn drop(&mut self) {
        self.stop();
        // Detach rather than join: the reader may be mid-read and the
        // process is going away anyway.
        drop(self.join_handle.take());
    }
}

enum ReadOutcome {
    Stopped,
    Delivered,
    Silent,
}

fn read_updates(
    reader: Box<dyn BufRead + Send>,
    stop_receiver: &mpsc::Receiver<()>,
    cache: &ResultCache,
    shared: &StreamShared,
    offline: Option<&OfflineStore>,
    transport: &dyn EdgeApi,
    env_key: &str,
) -> ReadOutcome {
    let mut delivered = false;
    for line in reader.lines() {
        if stop_receiver.try_recv().is_ok() {
            return ReadOutcome::Stopped;
        }
        match line {
            Ok(line) => {
                if let Some(update) = parse_stream_line(&line) {
                    delivered = true;
                    apply_update(&update, cache, shared, offline, Some(transport), env_key);
                }
            }
            Err(err) => {
                log::warn!(target: "pennant_sdk",
                           env_key:display = env_key,
                           error:display = err;
                           "config stream read failed; reconnecting");
                break;
            }
        }
    }
    if delivered {
        ReadOutcome::Delivered
    } else {
        ReadOutcome::Silent
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn parses_sse_and_bare_lines() {
        let update = ConfigUpdate::flag("prod", "f", 7, Utc::now());
        let json = serde_json::to_string(&update).unwrap();

        assert_eq!(parse_stream_line(&json), Some(update.clone()));
        assert_eq!(parse_stream_line(&format!("data: {json}")), Some(update));
        assert_eq!(parse_stream_line(""), None);
        assert_eq!(parse_stream_line(": comment"), None);
        assert_eq!(parse_stream_line("event: config"), None);
        assert_eq!(parse_stream_line("data: {\"type\":"), None);
    }

    #[test]
    fn backoff_doubles_to_a_cap() {
        let mut backoff = INITIAL_BACKOFF;
        let mut seen = vec![backoff];
        for _ in 0..6 {
            backoff = next_backoff(backoff);
            seen.push(backoff);
        }
        assert_eq!(seen[0], Duration::from_secs(1));
        assert_eq!(seen[1], Duration::from_secs(2));
        assert_eq!(seen[5], Duration::from_secs(30));
        assert_eq!(seen[6], Duration::from_secs(30));
    }

    #[test]
    fn flag_update_invalidates_narrowly() {
        let cache = ResultCache::new(100, Duration::from_secs(60));
        let shared = StreamShared::new();
        let result = |flag: &str| pennant_core::bucketer::EvaluationResult {
            flag_key: flag.to_owned(),
            variation_key: "on".to_owned(),
            value: true.into(),
            reason: pennant_core::bucketer::EvaluationReason::RuleMatch,
            rule_id: None,
            bucket: 0,
            bucketing_id: 0,
        };
        cache.put(result("f"), "alice");
        cache.put(result("g"), "alice");

        apply_update(
            &ConfigUpdate::flag("prod", "f", 9, Utc::now()),
            &cache,
            &shared,
            None,
            None,
            "prod",
        );

        assert!(cache.get("f", "alice").is_none());
        assert!(cache.get("g", "alice").is_some());
        assert_eq!(shared.committed_version(), 9);
    }

    #[test]
    fn environment_update_clears_everything() {
        let cache = ResultCache::new(100, Duration::from_secs(60));
        let shared = StreamShared::new();
        let result = pennant_core::bucketer::EvaluationResult {
            flag_key: "f".to_owned(),
            variation_key: "on".to_owned(),
            value: true.into(),
            reason: pennant_core::bucketer::EvaluationReason::RuleMatch,
            rule_id: None,
            bucket: 0,
            bucketing_id: 0,
        };
        cache.put(result, "alice");

        apply_update(
            &ConfigUpdate::environment("prod", 10, Utc::now()),
            &cache,
            &shared,
            None,
            None,
            "prod",
        );
        assert!(cache.get("f", "alice").is_none());
    }

    #[test]
    fn heartbeat_ahead_of_committed_state_resyncs() {
        let cache = ResultCache::new(100, Duration::from_secs(60));
        let shared = StreamShared::new();
        cache.put(
            pennant_core::bucketer::EvaluationResult {
                flag_key: "f".to_owned(),
                variation_key: "on".to_owned(),
                value: true.into(),
                reason: pennant_core::bucketer::EvaluationReason::RuleMatch,
                rule_id: None,
                bucket: 0,
                bucketing_id: 0,
            },
            "alice",
        );

        // The heartbeat proves a version this mirror never reconciled, so
        // the stale entries go and the counter may advance.
        apply_update(
            &ConfigUpdate::heartbeat("prod", 6, Utc::now()),
            &cache,
            &shared,
            None,
            None,
            "prod",
        );
        assert!(cache.get("f", "alice").is_none());
        assert_eq!(shared.committed_version(), 6);
    }

    #[test]
    fn heartbeat_at_committed_version_is_a_no_op() {
        let cache = ResultCache::new(100, Duration::from_secs(60));
        let shared = StreamShared::new();
        shared.commit_version(6);
        cache.put(
            pennant_core::bucketer::EvaluationResult {
                flag_key: "f".to_owned(),
                variation_key: "on".to_owned(),
                value: true.into(),
                reason: pennant_core::bucketer::EvaluationReason::RuleMatch,
                rule_id: None,
                bucket: 0,
                bucketing_id: 0,
            },
            "alice",
        );

        for version in [5, 6] {
            apply_update(
                &ConfigUpdate::heartbeat("prod", version, Utc::now()),
                &cache,
                &shared,
                None,
                None,
                "prod",
            );
        }
        assert!(cache.get("f", "alice").is_some());
        assert_eq!(shared.committed_version(), 6);
    }

    #[test]
    fn committed_version_is_monotonic() {
        let shared = StreamShared::new();
        shared.commit_version(5);
        shared.commit_version(3);
        assert_eq!(shared.committed_version(), 5);
        shared.commit_version(8);
        assert_eq!(shared.committed_version(), 8);
    }
}
