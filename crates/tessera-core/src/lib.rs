//! Tessera transport core logic
//!
//! This crate contains the pure state machines of the Tessera broker
//! transport: wire-format negotiation, inactivity monitoring, client
//! failover, network bridges and cluster membership. It is completely
//! decoupled from I/O, so every state transition can be driven from a test
//! with a fabricated clock.
//!
//! # Architecture: "The Hollow Shell"
//!
//! Protocol logic is strictly separated from transport concerns:
//!
//! ```text
//!        ┌──────────────────────────────┐
//!        │ tessera-core                 │
//!        │ - Negotiation, inactivity    │
//!        │ - Failover, bridges, cluster │
//!        └──────────────────────────────┘
//!           ↓                        ↓
//! ┌──────────────────┐   ┌──────────────────────────┐
//! │ tessera-harness  │   │ tessera-net / -client /  │
//! │ (Turmoil)        │   │ -broker (Tokio)          │
//! │ - Virtual time   │   │ - Real network           │
//! │ - Seeded RNG     │   │ - System clock           │
//! │ - Fault inject   │   │ - Production             │
//! └──────────────────┘   └──────────────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - No I/O in Core: Never call `tokio::spawn`, `std::time::Instant::now()`, or
//!   `rand::thread_rng()` directly
//! - Environment Trait: All side effects go through the `Environment` trait
//! - Actions Out: State machines return actions; drivers perform them
//!
//! # Modules
//!
//! - [`wire_format`]: Capability negotiation
//! - [`inactivity`]: Read deadline and keep-alive timer
//! - [`connection`]: Per-socket state machine (negotiation + monitoring)
//! - [`failover`]: Client-side failover across candidate brokers
//! - [`bridge`]: Broker-to-broker network bridge
//! - [`cluster`]: Membership registry and rebalance planning
//! - [`connector`]: Broker-side client registry and cluster notifications
//! - [`dispatch`]: Collaborator interface towards the dispatch layer
//! - [`transport`]: Byte-stream transport abstraction and scheme registry
//! - [`uri`], [`destination`], [`backoff`]: Supporting value types
//! - [`env`]: Environment abstraction (time, RNG)
//! - [`error`]: Error taxonomy

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod backoff;
pub mod bridge;
pub mod cluster;
pub mod connection;
pub mod connector;
pub mod destination;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod failover;
pub mod inactivity;
pub mod transport;
pub mod uri;
pub mod wire_format;

pub use error::{ErrorKind, TransportError};
