//! Deterministic simulation harness for Tessera.
//!
//! Turmoil-backed implementations of the core `Environment` and `Transport`
//! traits let brokers and failover clients run unchanged inside one
//! reproducible simulation: virtual time, seeded randomness, and a network
//! that can be partitioned or crashed on demand.
//!
//! The [`scenario`] module drives in-memory connection pairs without any
//! network at all, for negotiation and inactivity checks.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod recorder;
pub mod scenario;
pub mod sim_env;
pub mod sim_transport;

pub use recorder::{DispatchRecord, RecordingDispatch};
pub use sim_env::SimEnv;
pub use sim_transport::{SimTransport, sim_registry};
