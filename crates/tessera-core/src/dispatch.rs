//! Collaborator interface towards the broker's dispatch layer.
//!
//! The transport core never routes or stores messages. It tells the layer
//! above when a logical connection is usable, when it is gone, and which
//! messages arrived on it. Partially negotiated connections are invisible
//! here: `connection_established` fires only after negotiation succeeds,
//! and `connection_lost` only for connections that were established.

use std::{fmt, net::SocketAddr, time::Instant};

use tessera_proto::payloads::message::Message;

use crate::{error::TransportError, wire_format::WireFormatCapabilities};

/// Broker-local identifier of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Snapshot of an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection identifier
    pub id: ConnectionId,
    /// Name of the connector that accepted it
    pub connector: String,
    /// Peer socket address
    pub remote_addr: SocketAddr,
    /// Negotiated capabilities (fixed for the connection's lifetime)
    pub wire_format: WireFormatCapabilities,
    /// When negotiation completed
    pub established_at: Instant,
}

/// Receiver of connection lifecycle notifications.
///
/// Called from connection tasks while no broker lock is held;
/// implementations must not block.
pub trait Dispatch: Send + Sync + 'static {
    /// A connection finished negotiation.
    fn connection_established(&self, info: &ConnectionInfo);

    /// An established connection ended.
    fn connection_lost(&self, id: ConnectionId, reason: &TransportError);

    /// A message arrived from a client or a bridge.
    fn message_received(&self, id: ConnectionId, message: &Message) {
        let _ = (id, message);
    }
}

/// Dispatch layer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDispatch;

impl Dispatch for NoopDispatch {
    fn connection_established(&self, _info: &ConnectionInfo) {}

    fn connection_lost(&self, _id: ConnectionId, _reason: &TransportError) {}
}
