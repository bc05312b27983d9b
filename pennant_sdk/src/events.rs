//! Batched event forwarding.
//!
//! Three lanes (exposure, metric, custom), each flushed at whichever comes
//! first: the lane reaches the batch size, or the flush interval elapses.
//! Batches get bounded retries with exponential backoff and are dropped —
//! with a stat — when delivery keeps failing. Events are best effort by
//! contract; nothing here may block an evaluation.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use pennant_core::events::{EventBatch, EventKind};

use crate::transport::EdgeApi;

/// Forwarder tuning, filled from [`ClientConfig`](crate::ClientConfig).
#[derive(Clone)]
pub(crate) struct ForwarderOptions {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

/// Counters exposed through [`Client::status`](crate::Client::status).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    /// Events that reached the edge.
    pub delivered: u64,
    /// Events dropped after retries were exhausted.
    pub dropped: u64,
    /// Individual delivery attempts that failed.
    pub failed_attempts: u64,
}

#[derive(Default)]
struct Stats {
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed_attempts: AtomicU64,
}

struct Lanes {
    exposure: Mutex<VecDeque<serde_json::Value>>,
    metric: Mutex<VecDeque<serde_json::Value>>,
    custom: Mutex<VecDeque<serde_json::Value>>,
}

impl Lanes {
    fn lane(&self, kind: EventKind) -> &Mutex<VecDeque<serde_json::Value>> {
        match kind {
            EventKind::Exposure => &self.exposure,
            EventKind::Metric => &self.metric,
            EventKind::Custom => &self.custom,
        }
    }
}

enum Signal {
    Flush,
    Stop,
}

/// Background event forwarder thread.
pub(crate) struct EventForwarder {
    lanes: Arc<Lanes>,
    stats: Arc<Stats>,
    signal_sender: mpsc::Sender<Signal>,
    join_handle: Option<std::thread::JoinHandle<()>>,
    batch_size: usize,
}

impl EventForwarder {
    pub fn start(
        transport: Arc<dyn EdgeApi>,
        options: ForwarderOptions,
    ) -> std::io::Result<EventForwarder> {
        let lanes = Arc::new(Lanes {
            exposure: Mutex::new(VecDeque::new()),
            metric: Mutex::new(VecDeque::new()),
            custom: Mutex::new(VecDeque::new()),
        });
        let stats = Arc::new(Stats::default());
        let (signal_sender, signal_receiver) = mpsc::channel::<Signal>();

        let join_handle = {
            let lanes = Arc::clone(&lanes);
            let stats = Arc::clone(&stats);
            let options = options.clone();
            std::thread::Builder::new()
                .name("pennant-sdk-events".to_owned())
                .spawn(move || loop {
                    match signal_receiver.recv_timeout(options.flush_interval) {
                        Ok(Signal::Flush) | Err(RecvTimeoutError::Timeout) => {
                            flush_all(&lanes, transport.as_ref(), &options, &stats, options.max_retries);
                        }
                        Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => {
                            // Close drains once, single attempt per batch,
                            // so shutdown has a bounded deadline.
                            flush_all(&lanes, transport.as_ref(), &options, &stats, 0);
                            return;
                        }
                    }
                })?
        };

        Ok(EventForwarder {
            lanes,
            stats,
            signal_sender,
            join_handle: Some(join_handle),
            batch_size: options.batch_size,
        })
    }

    /// Enqueue one event. Triggers an early flush when the lane fills up to
    /// the batch size.
    pub fn track(&self, kind: EventKind, event: serde_json::Value) {
        let full = {
            let mut lane = self
                .lanes
                .lane(kind)
                .lock()
                .expect("event lane lock poisoned");
            lane.push_back(event);
            lane.len() >= self.batch_size
        };
        if full {
            // Error means the forwarder thread is gone; the event will be
            // dropped at close and counted there.
            let _ = self.signal_sender.send(Signal::Flush);
        }
    }

    pub fn stats(&self) -> ForwarderStats {
        ForwarderStats {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            failed_attempts: self.stats.failed_attempts.load(Ordering::Relaxed),
        }
    }

    /// Stop the thread after one final drain.
    pub fn close(mut self) {
        let _ = self.signal_sender.send(Signal::Stop);
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

fn flush_all(
    lanes: &Lanes,
    transport: &dyn EdgeApi,
    options: &ForwarderOptions,
    stats: &Stats,
    retries: u32,
) {
    for kind in [EventKind::Exposure, EventKind::Metric, EventKind::Custom] {
        loop {
            let events: Vec<serde_json::Value> = {
                let mut lane = lanes.lane(kind).lock().expect("event lane lock poisoned");
                let take = options.batch_size.min(lane.len());
                lane.drain(..take).collect()
            };
            if events.is_empty() {
                break;
            }
            let len = events.len() as u64;
            let batch = EventBatch {
                events,
                timestamp: Utc::now(),
                batch_id: format!("{:032x}", rand::random::<u128>()),
            };

            let mut delay = options.retry_backoff;
            let mut landed = false;
            for attempt in 0..=retries {
                match transport.submit_events(kind, &batch) {
                    Ok(()) => {
                        landed = true;
                        break;
                    }
                    Err(err) => {
                        stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                        log::warn!(target: "pennant_sdk",
                                   kind:display = kind.as_str(),
                                   batch_id:display = batch.batch_id,
                                   attempt;
                                   "event batch delivery failed: {err}");
                        if attempt < retries {
                            std::thread::sleep(delay);
                            delay *= 2;
                        }
                    }
                }
            }
            if landed {
                stats.delivered.fetch_add(len, Ordering::Relaxed);
            } else {
                stats.dropped.fetch_add(len, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufRead;
    use std::sync::atomic::AtomicBool;

    use pennant_core::snapshot::EnvSnapshot;
    use pennant_core::{Error, Result, UserContext};

    use crate::transport::EvaluateOutcome;

    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        batches: Mutex<Vec<(EventKind, EventBatch)>>,
        fail: AtomicBool,
    }

    impl EdgeApi for RecordingTransport {
        fn evaluate(
            &self,
            _env_key: &str,
            _context: &UserContext,
            _flag_keys: &[String],
            _timeout: Duration,
        ) -> Result<EvaluateOutcome> {
            unimplemented!("not used by forwarder tests")
        }
        fn fetch_snapshot(&self, _env_key: &str) -> Result<EnvSnapshot> {
            unimplemented!("not used by forwarder tests")
        }
        fn submit_events(&self, kind: EventKind, batch: &EventBatch) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(Error::Unavailable("down".to_owned()));
            }
            self.batches.lock().unwrap().push((kind, batch.clone()));
            Ok(())
        }
        fn open_stream(&self, _env_key: &str) -> Result<Box<dyn BufRead + Send>> {
            unimplemented!("not used by forwarder tests")
        }
    }

    fn options() -> ForwarderOptions {
        ForwarderOptions {
            batch_size: 3,
            flush_interval: Duration::from_millis(25),
            max_retries: 1,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn event(n: usize) -> serde_json::Value {
        serde_json::json!({ "n": n })
    }

    #[test]
    fn flushes_when_batch_size_reached() {
        let transport = Arc::new(RecordingTransport::default());
        let forwarder = EventForwarder::start(
            transport.clone(),
            ForwarderOptions {
                flush_interval: Duration::from_secs(3600),
                ..options()
            },
        )
        .unwrap();

        for n in 0..3 {
            forwarder.track(EventKind::Metric, event(n));
        }
        std::thread::sleep(Duration::from_millis(100));

        let batches = transport.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, EventKind::Metric);
        assert_eq!(batches[0].1.events.len(), 3);
        drop(batches);
        assert_eq!(forwarder.stats().delivered, 3);
        forwarder.close();
    }

    #[test]
    fn flushes_on_interval() {
        let transport = Arc::new(RecordingTransport::default());
        let forwarder = EventForwarder::start(transport.clone(), options()).unwrap();

        forwarder.track(EventKind::Custom, event(0));
        std::thread::sleep(Duration::from_millis(120));

        assert_eq!(transport.batches.lock().unwrap().len(), 1);
        forwarder.close();
    }

    #[test]
    fn failed_batches_are_dropped_with_stats() {
        let transport = Arc::new(RecordingTransport::default());
        transport.fail.store(true, Ordering::Relaxed);
        let forwarder = EventForwarder::start(transport.clone(), options()).unwrap();

        for n in 0..3 {
            forwarder.track(EventKind::Exposure, event(n));
        }
        std::thread::sleep(Duration::from_millis(150));

        let stats = forwarder.stats();
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.dropped, 3);
        // max_retries = 1 means two attempts per batch.
        assert!(stats.failed_attempts >= 2);
        forwarder.close();
    }

    #[test]
    fn close_drains_pending_events() {
        let transport = Arc::new(RecordingTransport::default());
        let forwarder = EventForwarder::start(
            transport.clone(),
            ForwarderOptions {
                flush_interval: Duration::from_secs(3600),
                batch_size: 100,
                ..options()
            },
        )
        .unwrap();

        forwarder.track(EventKind::Metric, event(1));
        forwarder.track(EventKind::Exposure, event(2));
        forwarder.close();

        let batches = transport.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
    }
}
