//! Discoverd adapter for sirenia.
//!
//! [`DiscoverdClient`] speaks the discoverd HTTP API: instance listing and
//! registration, service metadata with index compare-and-swap, and
//! server-sent event streams. [`ServiceDiscoverd`] wraps a service as the
//! [`Discoverd`](sirenia_state::Discoverd) a peer consumes, storing the
//! cluster state in the service metadata.

#![forbid(unsafe_code)]

mod client;
mod error;
mod heartbeat;
mod peer;
mod sse;
mod watch;

pub use client::{instance_id, DiscoverdClient, Service, DEFAULT_URL};
pub use error::{DiscoverdError, DiscoverdResult};
pub use heartbeat::Heartbeater;
pub use peer::ServiceDiscoverd;
pub use sse::SseDecoder;
pub use watch::Watch;
