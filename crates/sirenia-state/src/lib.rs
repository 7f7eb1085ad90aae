//! The sirenia peer state machine.
//!
//! [`Peer`] consumes membership and cluster state from a [`Discoverd`]
//! implementation, derives its role in the replication chain and drives a
//! local [`Database`] to match. [`MemoryDiscoverd`] and the [`simulator`]
//! provide deterministic in-process collaborators for tests and debugging.

#![forbid(unsafe_code)]

mod error;
mod memory;
mod peer;
pub mod simulator;
mod traits;
mod types;

pub use error::{DatabaseError, SimulatorError, StateError, StateResult, StoreError};
pub use memory::{MemoryDiscoverd, MemoryDiscoverdClient};
pub use peer::{Peer, PeerBuilder};
pub use traits::{Database, Discoverd};
pub use types::{DatabaseEvent, DiscoverdEvent, PeerHooks};
