//! The wire to the edge evaluator.
//!
//! Everything network-shaped sits behind [`EdgeApi`] so the rest of the
//! runtime (and the tests) never touch a socket directly.
use std::collections::HashMap;
use std::io::BufRead;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use pennant_core::bucketer::EvaluationResult;
use pennant_core::events::{EventBatch, EventKind};
use pennant_core::snapshot::EnvSnapshot;
use pennant_core::{Error, Result, UserContext};

/// Parsed `/evaluate` response.
#[derive(Debug, Deserialize)]
pub struct EvaluateOutcome {
    pub flags: HashMap<String, EvaluationResult>,
    pub config_version: u64,
}

/// Blocking client surface of the edge evaluator.
pub trait EdgeApi: Send + Sync {
    /// Evaluate `flag_keys` for `context`, bounded by `timeout`.
    fn evaluate(
        &self,
        env_key: &str,
        context: &UserContext,
        flag_keys: &[String],
        timeout: Duration,
    ) -> Result<EvaluateOutcome>;

    /// Fetch the current environment snapshot (for the offline mirror).
    fn fetch_snapshot(&self, env_key: &str) -> Result<EnvSnapshot>;

    /// Deliver one event batch.
    fn submit_events(&self, kind: EventKind, batch: &EventBatch) -> Result<()>;

    /// Open the config-update stream. The reader yields one line per
    /// message. Implementations bound the silence between reads to three
    /// heartbeat intervals so dead connections surface as read errors.
    fn open_stream(&self, env_key: &str) -> Result<Box<dyn BufRead + Send>>;
}

/// [`EdgeApi`] over HTTP with bearer-token authentication.
pub struct HttpTransport {
    base_url: Url,
    token: String,
    // Client holds a connection pool internally, so we're reusing it
    // between requests. The stream client has no total deadline; silence is
    // bounded per read instead.
    client: reqwest::blocking::Client,
    stream_client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        token: impl Into<String>,
        heartbeat_interval: Duration,
    ) -> Result<HttpTransport> {
        let base_url = Url::parse(base_url)
            .map_err(|err| Error::Validation(format!("invalid base_url: {err}")))?;
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(request_error)?;
        let stream_client = reqwest::blocking::Client::builder()
            .timeout(None)
            .read_timeout(heartbeat_interval * 3)
            .build()
            .map_err(request_error)?;
        Ok(HttpTransport {
            base_url,
            token: token.into(),
            client,
            stream_client,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|err| Error::Validation(format!("invalid endpoint {path}: {err}")))
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl EdgeApi for HttpTransport {
    fn evaluate(
        &self,
        env_key: &str,
        context: &UserContext,
        flag_keys: &[String],
        timeout: Duration,
    ) -> Result<EvaluateOutcome> {
        let response = self
            .client
            .post(self.endpoint("evaluate")?)
            .timeout(timeout)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .json(&serde_json::json!({
                "env_key": env_key,
                "flag_keys": flag_keys,
                "context": context,
            }))
            .send()
            .map_err(request_error)?;

        let response = check_status(response)?;
        response
            .json()
            // A response that doesn't parse is a malformed server
            // response, not a network failure; callers invalidate and
            // serve the default.
            .map_err(|err| Error::Internal(format!("malformed evaluate response: {err}")))
    }

    fn fetch_snapshot(&self, env_key: &str) -> Result<EnvSnapshot> {
        let response = self
            .client
            .get(self.endpoint(&format!("configs/{env_key}"))?)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .map_err(request_error)?;
        let response = check_status(response)?;
        let bytes = response.bytes().map_err(request_error)?;
        EnvSnapshot::from_json(&bytes)
    }

    fn submit_events(&self, kind: EventKind, batch: &EventBatch) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(&format!("events/{}", kind.as_str()))?)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .header("X-Batch-ID", &batch.batch_id)
            .json(batch)
            .send()
            .map_err(request_error)?;
        check_status(response)?;
        Ok(())
    }

    fn open_stream(&self, env_key: &str) -> Result<Box<dyn BufRead + Send>> {
        let mut url = self.endpoint("stream")?;
        url.query_pairs_mut().append_pair("environment", env_key);
        let response = self
            .stream_client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .map_err(request_error)?;
        let response = check_status(response)?;
        Ok(Box::new(std::io::BufReader::new(response)))
    }
}

fn check_status(response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED => Err(Error::Unauthorized),
        StatusCode::FORBIDDEN => Err(Error::Forbidden),
        StatusCode::NOT_FOUND => Err(Error::NotFound("resource")),
        status if status.is_server_error() => {
            Err(Error::Unavailable(format!("edge returned {status}")))
        }
        status => Err(Error::Internal(format!("unexpected status {status}"))),
    }
}

fn request_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout
    } else {
        Error::Unavailable(err.without_url().to_string())
    }
}
