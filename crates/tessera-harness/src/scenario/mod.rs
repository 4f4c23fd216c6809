//! Scenario testing framework for in-memory connection pairs.
//!
//! A scenario wires a client and a server [`Connection`] back to back,
//! delivers every frame instantly, optionally advances virtual time or cuts
//! the link, and then hands the final [`World`] to a mandatory oracle.
//!
//! [`Connection`]: tessera_core::connection::Connection

mod builder;
pub mod oracle;
mod world;

pub use builder::{RunnableScenario, Scenario};
pub use oracle::OracleFn;
pub use world::{Side, World};
