//! Config-update fan-out.
//!
//! One broadcast channel per environment. The channel capacity doubles as
//! the slow-subscriber bound: a receiver that lags more than the backlog is
//! cut off and must reconnect, so one stuck client can never make the
//! publisher (or other subscribers) wait.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use pennant_core::snapshot::{ConfigUpdate, UpdatePublisher};

use crate::snapshots::SnapshotResolver;

/// Maximum per-subscriber backlog before the subscriber is dropped.
pub const STREAM_BACKLOG: usize = 256;

/// Per-environment broadcast channels.
#[derive(Default)]
pub struct StreamHub {
    channels: Mutex<HashMap<String, broadcast::Sender<ConfigUpdate>>>,
}

impl StreamHub {
    pub fn new() -> StreamHub {
        StreamHub::default()
    }

    /// Subscribe to one environment's updates.
    pub fn subscribe(&self, env_key: &str) -> broadcast::Receiver<ConfigUpdate> {
        let mut channels = self
            .channels
            .lock()
            .expect("thread holding stream hub lock should not panic");
        channels
            .entry(env_key.to_owned())
            .or_insert_with(|| broadcast::channel(STREAM_BACKLOG).0)
            .subscribe()
    }

    /// Deliver an update to every current subscriber of its environment.
    pub fn broadcast(&self, update: &ConfigUpdate) {
        let channels = self
            .channels
            .lock()
            .expect("thread holding stream hub lock should not panic");
        if let Some(sender) = channels.get(&update.env_key) {
            // Send fails only when nobody is listening, which is fine.
            let delivered = sender.send(update.clone()).unwrap_or(0);
            log::debug!(target: "pennant_edge",
                        env_key:display = update.env_key, delivered;
                        "broadcast config update");
        }
    }
}

/// The edge's stream bus: notes the new version for the local snapshot
/// resolver, then fans the update out to subscribers.
pub struct EdgePublisher {
    pub hub: Arc<StreamHub>,
    pub resolver: Arc<SnapshotResolver>,
}

impl UpdatePublisher for EdgePublisher {
    fn publish(&self, update: ConfigUpdate) {
        self.resolver.note_update(&update);
        self.hub.broadcast(&update);
    }
}
