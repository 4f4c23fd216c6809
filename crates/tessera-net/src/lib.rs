//! Tokio drivers for the Tessera transport core.
//!
//! This crate is the I/O side of the hollow shell: the state machines in
//! `tessera-core` decide, the types here read and write sockets.
//!
//! - [`codec`]: frame reader and writer over any `AsyncRead`/`AsyncWrite`
//! - [`socket`]: reader/writer pump tasks feeding a tagged event channel
//! - [`tcp`]: the production `tcp://` transport
//! - [`env`]: the production [`Environment`](tessera_core::env::Environment)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod env;
pub mod socket;
pub mod tcp;

use std::sync::Arc;

pub use codec::{read_frame, write_frame};
pub use env::SystemEnv;
pub use socket::{ConnectOutcome, Socket, SocketEvent, spawn_connect};
pub use tcp::TcpTransport;
use tessera_core::transport::TransportRegistry;

/// Registry with the transports this crate provides: `tcp`.
#[must_use]
pub fn default_registry() -> TransportRegistry {
    TransportRegistry::new().with("tcp", Arc::new(TcpTransport))
}
