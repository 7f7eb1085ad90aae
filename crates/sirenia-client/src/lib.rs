//! Client for the HTTP surface every sirenia peer serves.
//!
//! Besides plain request wrappers ([`SireniaClient::status`],
//! [`SireniaClient::stop`], tunables), the client offers the polling waits
//! the deployment controller and operators rely on:
//! [`SireniaClient::wait_for_repl_sync`] and
//! [`SireniaClient::wait_for_read_write`].

#![forbid(unsafe_code)]

mod client;
mod error;

pub use client::{SireniaClient, CHECK_INTERVAL};
pub use error::{ClientError, ClientResult};
