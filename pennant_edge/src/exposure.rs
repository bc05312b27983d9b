//! Batched event queues and the background drain to the Event Sink.
//!
//! Evaluation correctness never waits on ingestion: enqueues are a mutex
//! push, the queue is bounded, and overflow drops the oldest batch with a
//! counter rather than blocking. A dedicated thread drains the queues on an
//! interval and submits batches with bounded retries and exponential
//! backoff.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use pennant_core::events::{EventBatch, EventKind, EventSink, ExposureEvent};

/// Queue and delivery tuning.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Maximum events held per lane before the oldest batch is dropped.
    pub capacity: usize,
    /// Events per submitted batch.
    pub batch_size: usize,
    /// How often the drain thread wakes.
    pub flush_interval: Duration,
    /// Delivery attempts per batch before it is dropped.
    pub max_retries: u32,
    /// Initial backoff between attempts; doubles per retry.
    pub retry_backoff: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            capacity: 10_000,
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// The three bounded lanes plus drop accounting.
pub struct EventQueues {
    exposure: Mutex<VecDeque<serde_json::Value>>,
    metric: Mutex<VecDeque<serde_json::Value>>,
    custom: Mutex<VecDeque<serde_json::Value>>,
    capacity: usize,
    batch_size: usize,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl EventQueues {
    pub fn new(config: &ForwarderConfig) -> EventQueues {
        EventQueues {
            exposure: Mutex::new(VecDeque::new()),
            metric: Mutex::new(VecDeque::new()),
            custom: Mutex::new(VecDeque::new()),
            capacity: config.capacity,
            batch_size: config.batch_size,
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append events to a lane, shedding the oldest batch on overflow.
    pub fn push(&self, kind: EventKind, events: impl IntoIterator<Item = serde_json::Value>) {
        let mut queue = self.lane(kind).lock().expect("event queue lock poisoned");
        let mut added = 0u64;
        for event in events {
            queue.push_back(event);
            added += 1;
        }
        self.enqueued.fetch_add(added, Ordering::Relaxed);

        let mut shed = 0u64;
        while queue.len() > self.capacity {
            for _ in 0..self.batch_size.min(queue.len()) {
                queue.pop_front();
                shed += 1;
            }
        }
        if shed > 0 {
            self.dropped.fetch_add(shed, Ordering::Relaxed);
            log::warn!(target: "pennant_edge",
                       kind:display = kind.as_str(), shed;
                       "event queue overflow; oldest batch dropped");
        }
    }

    /// Serialize and enqueue one exposure record.
    pub fn push_exposure(&self, event: &ExposureEvent) {
        match serde_json::to_value(event) {
            Ok(value) => self.push(EventKind::Exposure, [value]),
            Err(err) => {
                log::error!(target: "pennant_edge", error:display = err;
                            "failed to serialize exposure event");
            }
        }
    }

    /// Take up to `max` events from a lane.
    pub fn drain(&self, kind: EventKind, max: usize) -> Vec<serde_json::Value> {
        let mut queue = self.lane(kind).lock().expect("event queue lock poisoned");
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    pub fn len(&self, kind: EventKind) -> usize {
        self.lane(kind).lock().expect("event queue lock poisoned").len()
    }

    /// Events shed on overflow or after delivery gave up.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn note_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    fn lane(&self, kind: EventKind) -> &Mutex<VecDeque<serde_json::Value>> {
        match kind {
            EventKind::Exposure => &self.exposure,
            EventKind::Metric => &self.metric,
            EventKind::Custom => &self.custom,
        }
    }
}

/// Background drain thread. Owns nothing but the loop; the queues are
/// shared with the request handlers that feed them.
pub struct EventForwarder {
    stop_sender: mpsc::Sender<()>,
    join_handle: std::thread::JoinHandle<()>,
}

impl EventForwarder {
    /// Start the drain thread.
    pub fn start(
        queues: Arc<EventQueues>,
        sink: Arc<dyn EventSink>,
        config: ForwarderConfig,
    ) -> std::io::Result<EventForwarder> {
        let (stop_sender, stop_receiver) = mpsc::channel::<()>();

        let join_handle = std::thread::Builder::new()
            .name("pennant-edge-events".to_owned())
            .spawn(move || loop {
                match stop_receiver.recv_timeout(config.flush_interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        flush_all(&queues, sink.as_ref(), &config, config.max_retries);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        // Final drain: one attempt per batch, no retries, so
                        // shutdown stays bounded.
                        flush_all(&queues, sink.as_ref(), &config, 0);
                        return;
                    }
                }
            })?;

        Ok(EventForwarder {
            stop_sender,
            join_handle,
        })
    }

    /// Stop the drain thread after one final bounded drain.
    pub fn shutdown(self) {
        let _ = self.stop_sender.send(());
        let _ = self.join_handle.join();
    }
}

fn flush_all(
    queues: &EventQueues,
    sink: &dyn EventSink,
    config: &ForwarderConfig,
    retries: u32,
) {
    for kind in [EventKind::Exposure, EventKind::Metric, EventKind::Custom] {
        loop {
            let events = queues.drain(kind, config.batch_size);
            if events.is_empty() {
                break;
            }
            let len = events.len() as u64;
            let batch = EventBatch {
                events,
                timestamp: Utc::now(),
                batch_id: format!("{:032x}", rand::random::<u128>()),
            };
            if !submit_with_retry(sink, kind, &batch, retries, config.retry_backoff) {
                queues.note_dropped(len);
            }
        }
    }
}

fn submit_with_retry(
    sink: &dyn EventSink,
    kind: EventKind,
    batch: &EventBatch,
    retries: u32,
    backoff: Duration,
) -> bool {
    let mut delay = backoff;
    for attempt in 0..=retries {
        match sink.submit(kind, batch) {
            Ok(()) => return true,
            Err(err) => {
                log::warn!(target: "pennant_edge",
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
    false
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use pennant_core::{Error, Result};

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        batches: StdMutex<Vec<(EventKind, EventBatch)>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl EventSink for RecordingSink {
        fn submit(&self, kind: EventKind, batch: &EventBatch) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(Error::Unavailable("sink down".to_owned()));
            }
            self.batches.lock().unwrap().push((kind, batch.clone()));
            Ok(())
        }
    }

    fn event(n: usize) -> serde_json::Value {
        serde_json::json!({ "n": n })
    }

    fn config() -> ForwarderConfig {
        ForwarderConfig {
            capacity: 1000,
            batch_size: 100,
            flush_interval: Duration::from_millis(20),
            max_retries: 1,
            retry_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn drains_in_batches() {
        let cfg = config();
        let queues = EventQueues::new(&cfg);
        let sink = RecordingSink::default();
        queues.push(EventKind::Exposure, (0..250).map(event));

        flush_all(&queues, &sink, &cfg, 0);

        let batches = sink.batches.lock().unwrap();
        let sizes: Vec<_> = batches.iter().map(|(_, b)| b.events.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert!(batches.iter().all(|(kind, _)| *kind == EventKind::Exposure));
        assert_eq!(queues.len(EventKind::Exposure), 0);
    }

    #[test]
    fn overflow_sheds_oldest_first() {
        let cfg = ForwarderConfig {
            capacity: 150,
            batch_size: 100,
            ..config()
        };
        let queues = EventQueues::new(&cfg);
        queues.push(EventKind::Metric, (0..250).map(event));

        // 250 - 100 = 150 left, and the survivors are the newest.
        assert_eq!(queues.len(EventKind::Metric), 150);
        assert_eq!(queues.dropped(), 100);
        let remaining = queues.drain(EventKind::Metric, 1);
        assert_eq!(remaining[0]["n"], 100);
    }

    #[test]
    fn undeliverable_batches_are_dropped_and_counted() {
        let cfg = config();
        let queues = EventQueues::new(&cfg);
        let sink = RecordingSink::default();
        sink.fail.store(true, Ordering::Relaxed);
        queues.push(EventKind::Custom, (0..10).map(event));

        flush_all(&queues, &sink, &cfg, 1);

        assert_eq!(queues.dropped(), 10);
        assert_eq!(queues.len(EventKind::Custom), 0);
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn forwarder_thread_flushes_on_interval() {
        let cfg = config();
        let queues = Arc::new(EventQueues::new(&cfg));
        let sink = Arc::new(RecordingSink::default());
        let forwarder =
            EventForwarder::start(queues.clone(), sink.clone(), cfg).unwrap();

        queues.push(EventKind::Exposure, (0..3).map(event));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(queues.len(EventKind::Exposure), 0);
        assert!(!sink.batches.lock().unwrap().is_empty());

        // Shutdown drains whatever is still queued.
        queues.push(EventKind::Exposure, (0..2).map(event));
        forwarder.shutdown();
        assert_eq!(queues.len(EventKind::Exposure), 0);
    }
}
