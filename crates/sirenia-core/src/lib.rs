//! Core types shared by every sirenia crate.
//!
//! Sirenia manages a chain-replicated database cluster:
//!
//! ```text
//! primary ──▶ sync ──▶ async[0] ──▶ async[1] ──▶ …
//! ```
//!
//! The authoritative cluster [`State`] lives in the discovery layer and is only
//! ever written with a compare-and-swap on its index ([`DiscoverdState`]). Each
//! node runs a peer that derives its [`Role`] from that state and drives its
//! local database with a [`Config`].
//!
//! This crate holds the wire-visible data model, the transaction log
//! abstraction ([`XLog`]) and the injectable [`Clock`].

#![forbid(unsafe_code)]

pub mod clock;
pub mod discoverd;
pub mod error;
pub mod state;
pub mod status;
pub mod xlog;

pub use clock::{Clock, FixedClock, SystemClock};
pub use discoverd::{EventKind, Instance, ServiceEvent, ServiceMeta};
pub use error::{CoreError, CoreResult};
pub use state::{
    Config, DiscoverdState, FreezeDetails, PeerInfo, Role, State, Tunables,
    SINGLETON_FREEZE_REASON,
};
pub use status::{DatabaseInfo, Status};
pub use xlog::{PgXLog, Position, XLog, XLogError};
