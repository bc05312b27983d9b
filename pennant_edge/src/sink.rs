//! Event Sink clients.
//!
//! The sink is an external collaborator; these are the two concrete
//! transports the edge ships with. Both are driven only from the forwarder
//! thread, which is why the HTTP client is blocking and built lazily there.
use std::sync::OnceLock;

use pennant_core::events::{EventBatch, EventKind, EventSink};
use pennant_core::{Error, Result};

/// Sink that only logs. The default for local runs where no ingestion
/// service exists.
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn submit(&self, kind: EventKind, batch: &EventBatch) -> Result<()> {
        log::info!(target: "pennant_edge",
                   kind:display = kind.as_str(),
                   batch_id:display = batch.batch_id,
                   events = batch.events.len();
                   "discarding event batch (no sink configured)");
        Ok(())
    }
}

/// HTTP sink: `POST {base_url}/{kind}` with the batch as JSON and the
/// batch id duplicated in `X-Batch-ID` for idempotent ingestion.
pub struct HttpEventSink {
    base_url: String,
    client: OnceLock<reqwest::blocking::Client>,
}

impl HttpEventSink {
    pub fn new(base_url: impl Into<String>) -> HttpEventSink {
        HttpEventSink {
            base_url: base_url.into(),
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> &reqwest::blocking::Client {
        // Built on first use so construction happens on the forwarder
        // thread, never inside an async runtime.
        self.client.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build event sink http client")
        })
    }
}

impl EventSink for HttpEventSink {
    fn submit(&self, kind: EventKind, batch: &EventBatch) -> Result<()> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), kind.as_str());
        let response = self
            .client()
            .post(url)
            .header("X-Batch-ID", &batch.batch_id)
            .json(batch)
            .send()
            .map_err(|err| Error::Unavailable(format!("event sink: {err}")))?;

        response
            .error_for_status()
            .map_err(|err| Error::Unavailable(format!("event sink: {err}")))?;
        Ok(())
    }
}
