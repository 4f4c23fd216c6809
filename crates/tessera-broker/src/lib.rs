//! Tessera broker runtime.
//!
//! A [`Broker`] owns its transport connectors, its network bridges and
//! the cluster topology built from them:
//!
//! ```text
//!            accept loops                      bridge tasks
//! clients ──► connector ──► client task    ──► NetworkBridge ──► remote brokers
//!                              │                    │
//!                              └──── BrokerState ───┘
//!                              topology · connectors · bridge table
//! ```
//!
//! Clients of a connector with `rebalance_clients` set learn every member
//! of the cluster and are told to migrate when a new broker joins.
//! Messages received from clients or bridges are handed to the
//! [`Dispatch`](tessera_core::dispatch::Dispatch) layer and offered to
//! every other bridge.
//!
//! The runtime is generic over [`Environment`](tessera_core::env::Environment)
//! and resolves URI schemes through a
//! [`TransportRegistry`](tessera_core::transport::TransportRegistry), so the
//! same code runs over TCP in production and over turmoil in simulation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
mod peer;

pub use broker::Broker;
pub use config::{BrokerConfig, ConfigError};
pub use dispatch::LoggingDispatch;
pub use error::BrokerError;
