//! Client errors.

use tessera_core::{TransportError, uri::UriError};
use thiserror::Error;

/// Errors surfaced by [`FailoverClient`](crate::FailoverClient).
///
/// Connection failures are never reported here: the failover state machine
/// absorbs them and the application sees [`TransportEvent`]s instead.
///
/// [`TransportEvent`]: tessera_core::failover::TransportEvent
#[derive(Error, Debug)]
pub enum ClientError {
    /// The failover URI does not parse
    #[error("invalid failover uri: {0}")]
    Uri(#[from] UriError),

    /// Configuration rejected, or the transport was closed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame could not be encoded
    #[error(transparent)]
    Protocol(#[from] tessera_proto::ProtocolError),

    /// The driver task is gone (closed or dropped)
    #[error("client driver stopped")]
    Stopped,
}
