//! Failover client for Tessera brokers.
//!
//! [`FailoverClient`] drives a [`FailoverTransport`] over real (or
//! simulated) sockets:
//!
//! ```text
//! application ──send──► FailoverClient ──commands──► driver task
//!                                                     │  FailoverTransport (sans-IO)
//! application ◄─events── ClientEvent ◄──actions──────┘  Socket pumps, connect tasks
//! ```
//!
//! The application sees `Connected`, `Interrupted`, `Resumed`, `Exhausted`
//! and `Closed` transitions, never a half-negotiated connection. Frames
//! sent while disconnected are buffered and replayed in order.
//!
//! [`FailoverTransport`]: tessera_core::failover::FailoverTransport

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod error;

pub use client::{ClientEvent, ClientStatus, FailoverClient};
pub use error::ClientError;
