//! Stream only the changes of a Consul service registry.
//!
//! Pollers long-poll the registry with blocking queries, diff each new
//! snapshot against the last one they observed and push the resulting
//! [`types::DeltaEvent`]s to an [`emitter::EventSink`].

pub mod config;
pub mod diff;
pub mod emitter;
pub mod error;
pub mod poller;
pub mod registry;
pub mod types;
