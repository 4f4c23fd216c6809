//! Error types for the transport core.
//!
//! [`TransportError`] is the single error channel of every connection,
//! failover and bridge state machine. [`ErrorKind`] folds it into the
//! coarse taxonomy that decides recovery: reconnect, drop, or give up.

use std::{io, time::Duration};

use tessera_proto::ProtocolError;
use thiserror::Error;

use crate::{connection::ConnectionPhase, uri::UriError};

/// Errors produced by connections, failover transports and bridges.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Peer did not complete wire-format negotiation in time
    #[error("protocol negotiation timed out after {elapsed:?}")]
    NegotiationTimeout {
        /// Time spent waiting for the peer's negotiation frame
        elapsed: Duration,
    },

    /// Peer capabilities were unparseable or incompatible
    #[error("protocol negotiation mismatch: {0}")]
    NegotiationMismatch(String),

    /// Inactivity monitor saw no inbound traffic within its limit
    #[error("connection inactive: no traffic for {elapsed:?} (limit {limit:?})")]
    ConnectionInactive {
        /// Time since the last inbound frame
        elapsed: Duration,
        /// Read deadline in force
        limit: Duration,
    },

    /// Transport-level failure
    #[error("socket error: {0}")]
    Socket(String),

    /// A bridge could not reach its remote broker
    #[error("cluster member {uri} unreachable: {reason}")]
    ClusterMemberUnreachable {
        /// Remote broker URI
        uri: String,
        /// Underlying failure
        reason: String,
    },

    /// Every failover candidate failed in this round; backing off
    #[error("all {candidates} broker candidates exhausted, retrying in {retry_in:?}")]
    ExhaustedCandidates {
        /// Number of candidates tried
        candidates: usize,
        /// Backoff before the next round
        retry_in: Duration,
    },

    /// Operation not valid in the current phase
    #[error("invalid state: cannot {operation} while {phase:?}")]
    InvalidState {
        /// Phase when the call was made
        phase: ConnectionPhase,
        /// Attempted operation
        operation: &'static str,
    },

    /// Frame not valid in the current phase
    #[error("unexpected frame {opcode:#06x} while {phase:?}")]
    UnexpectedFrame {
        /// Phase when the frame arrived
        phase: ConnectionPhase,
        /// Raw opcode
        opcode: u16,
    },

    /// Peer closed the connection gracefully
    #[error("peer shut down: {reason}")]
    PeerShutdown {
        /// Reason the peer gave
        reason: String,
    },

    /// Peer sent an error frame
    #[error("peer reported error {code:#06x}: {message}")]
    Remote {
        /// Error code from the peer
        code: u16,
        /// Message from the peer
        message: String,
    },

    /// Malformed frame
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Invalid configuration detected at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Explicitly closed by the owner
    #[error("transport closed")]
    Closed,
}

/// Coarse error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// PROTOCOL_NEGOTIATION_TIMEOUT
    NegotiationTimeout,
    /// PROTOCOL_NEGOTIATION_MISMATCH
    NegotiationMismatch,
    /// CONNECTION_INACTIVE
    ConnectionInactive,
    /// SOCKET_ERROR
    Socket,
    /// CLUSTER_MEMBER_UNREACHABLE
    ClusterMemberUnreachable,
    /// CLIENT_EXHAUSTED_CANDIDATES
    ExhaustedCandidates,
    /// Startup configuration error
    Configuration,
    /// Explicit shutdown
    Closed,
}

impl ErrorKind {
    /// Numeric code carried in error frames.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::NegotiationTimeout => 0x0100,
            Self::NegotiationMismatch => 0x0101,
            Self::ConnectionInactive => 0x0102,
            Self::Socket => 0x0103,
            Self::ClusterMemberUnreachable => 0x0104,
            Self::ExhaustedCandidates => 0x0105,
            Self::Configuration => 0x0106,
            Self::Closed => 0x0107,
        }
    }
}

impl TransportError {
    /// Taxonomy bucket for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NegotiationTimeout { .. } => ErrorKind::NegotiationTimeout,
            Self::NegotiationMismatch(_) => ErrorKind::NegotiationMismatch,
            Self::ConnectionInactive { .. } => ErrorKind::ConnectionInactive,
            Self::Socket(_)
            | Self::InvalidState { .. }
            | Self::UnexpectedFrame { .. }
            | Self::PeerShutdown { .. }
            | Self::Remote { .. }
            | Self::Protocol(_) => ErrorKind::Socket,
            Self::ClusterMemberUnreachable { .. } => ErrorKind::ClusterMemberUnreachable,
            Self::ExhaustedCandidates { .. } => ErrorKind::ExhaustedCandidates,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Closed => ErrorKind::Closed,
        }
    }

    /// Returns true if the owning component should keep going (reconnect,
    /// retry, or drop just this connection).
    ///
    /// Only explicit shutdown and startup configuration errors are terminal.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Configuration | ErrorKind::Closed)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Socket(err.to_string())
    }
}

impl From<UriError> for TransportError {
    fn from(err: UriError) -> Self {
        Self::Config(err.to_string())
    }
}
