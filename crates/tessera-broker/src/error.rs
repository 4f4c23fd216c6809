//! Broker runtime errors.

use std::io;

use tessera_core::TransportError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors returned by [`Broker`](crate::Broker) operations.
///
/// Runtime connection failures never show up here; connectors drop the
/// affected connection and bridges retry.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Invalid connector or bridge settings, or an unknown URI scheme
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A connector could not listen
    #[error("cannot listen on {uri}: {source}")]
    Bind {
        /// Connector URI
        uri: String,
        /// Underlying error
        source: io::Error,
    },

    /// A bridge with this name already runs
    #[error("duplicate bridge {0:?}")]
    DuplicateBridge(String),

    /// The broker has been shut down
    #[error("broker stopped")]
    Stopped,
}
