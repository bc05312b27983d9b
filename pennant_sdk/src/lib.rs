//! Pennant SDK for Rust.
//!
//! Gives application code a low-latency, resilient evaluation surface that
//! mirrors server state: an LRU result cache, a streaming subscriber that
//! invalidates on server updates, an offline snapshot file for
//! network-partition fallback, and a batched event forwarder.
//!
//! # Evaluation contract
//!
//! [`Client::evaluate`] never panics across the boundary and always
//! answers: on any internal error or timeout it returns the caller-supplied
//! default with reason `error`. Cache hits are non-blocking; a cache miss
//! issues at most one network request, and [`Client::evaluate_multiple`]
//! coalesces all misses of one call into a single request. When the network
//! is gone, evaluation falls back to the persisted offline snapshot using
//! the same bucketing kernel the server runs, so decisions stay identical.
//!
//! # Examples
//! ```no_run
//! use pennant_sdk::{Client, ClientConfig};
//! use pennant_core::UserContext;
//!
//! let mut client = Client::new(ClientConfig::new(
//!     "http://localhost:8787",
//!     "production",
//!     "ff_0123456789abcdef…",
//! )).unwrap();
//! client.start_stream();
//!
//! let user = UserContext::new("user-42").with_attribute("country", "US");
//! let enabled = client.boolean_value("checkout_redesign", &user, false);
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

mod client;
mod config;
mod events;
mod offline;
mod result_cache;
mod stream;
mod transport;

pub use client::{BatchEvaluation, Client, SdkStatus};
pub use config::ClientConfig;
pub use events::ForwarderStats;
pub use offline::OfflineStore;
pub use stream::StreamStatus;
pub use transport::{EdgeApi, EvaluateOutcome, HttpTransport};

// Re-exported so applications don't need a direct pennant_core dependency
// for the common types.
pub use pennant_core::bucketer::{EvaluationReason, EvaluationResult};
pub use pennant_core::snapshot::Value;
pub use pennant_core::{AttributeValue, Attributes, Error, Result, UserContext};
