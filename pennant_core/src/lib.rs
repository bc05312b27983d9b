//! `pennant_core` is the shared library behind the Pennant feature-flag
//! platform. The edge evaluator and the client SDK are both built on top of
//! it, which is what keeps their bucketing decisions byte-identical.
//!
//! # Overview
//!
//! The crate is organized as a set of building blocks:
//!
//! - [`bucketer`] — the deterministic evaluation kernel. Pure; no I/O, no
//!   clocks, no randomness beyond the environment salt carried in the
//!   snapshot.
//! - [`compiler`] — turns the authoring state of one environment into an
//!   immutable, versioned [`snapshot::EnvSnapshot`] and publishes it.
//! - [`snapshot`] — the wire/data model shared by every consumer.
//! - [`authoring`], [`cache`], [`events`] — traits for the external
//!   collaborators (authoring store, snapshot cache, event sink, trust).
//!
//! # Compatibility
//!
//! The bucketing hash ([`bucketer::hash`]) and the canonical snapshot
//! serialization ([`snapshot`]) are public contracts shared with every SDK.
//! Changing either is a breaking change across the whole fleet.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod authoring;
pub mod bucketer;
pub mod cache;
pub mod compiler;
pub mod events;
pub mod snapshot;
pub mod token;

mod attributes;
mod context;
mod error;

pub use attributes::{AttributeValue, Attributes};
pub use context::UserContext;
pub use error::{Error, EvaluationError, Result};
