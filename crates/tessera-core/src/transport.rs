//! Transport abstraction for network I/O.
//!
//! A `Transport` opens and accepts reliable, ordered byte streams for one
//! URI scheme. This allows the same connector, bridge and failover drivers
//! to run over:
//!
//! - **TCP** (production, `tcp://`)
//! - **Turmoil TCP** (simulation, registered by the harness)
//!
//! Transports are selected at runtime through a [`TransportRegistry`]
//! keyed by URI scheme, so a connector URI or a failover candidate picks
//! its implementation by name instead of by type.

use std::{collections::BTreeMap, fmt, io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{error::TransportError, uri::BrokerUri};

/// Read half of a transport stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a transport stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One established byte stream, already split into halves.
pub struct TransportStream {
    /// Inbound bytes
    pub reader: BoxedReader,
    /// Outbound bytes
    pub writer: BoxedWriter,
    /// Peer address
    pub remote_addr: SocketAddr,
    /// Local address
    pub local_addr: SocketAddr,
}

impl fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportStream")
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Abstract transport for reliable, ordered byte streams.
///
/// # Guarantees expected from implementations
///
/// - **Reliability**: Bytes are delivered or an error is returned
/// - **Ordering**: Bytes arrive in the order they were sent
/// - **Cancellation safety**: dropping a pending `connect` or `accept`
///   future leaves no half-open socket behind
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a stream to `uri`.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the host does not resolve or the peer
    /// refuses or drops the connection.
    async fn connect(&self, uri: &BrokerUri) -> io::Result<TransportStream>;

    /// Listen on the authority of `uri`.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the address cannot be bound.
    async fn bind(&self, uri: &BrokerUri) -> io::Result<Box<dyn TransportListener>>;
}

/// Accept side of a [`Transport`].
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// Wait for the next inbound stream.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the listener is closed or the accept
    /// fails.
    async fn accept(&self) -> io::Result<TransportStream>;

    /// Bound address.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the socket is no longer bound.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Named transport implementations, keyed by URI scheme.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: BTreeMap<String, Arc<dyn Transport>>,
}

impl TransportRegistry {
    /// Registry with no transports.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transport` for `scheme`, replacing any previous entry.
    #[must_use]
    pub fn with(mut self, scheme: &str, transport: Arc<dyn Transport>) -> Self {
        self.register(scheme, transport);
        self
    }

    /// Register `transport` for `scheme`, replacing any previous entry.
    pub fn register(&mut self, scheme: &str, transport: Arc<dyn Transport>) {
        self.transports.insert(scheme.to_ascii_lowercase(), transport);
    }

    /// Transport for the scheme of `uri`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` for an unregistered scheme.
    pub fn resolve(&self, uri: &BrokerUri) -> Result<Arc<dyn Transport>, TransportError> {
        self.transports.get(uri.scheme()).cloned().ok_or_else(|| {
            TransportError::Config(format!("no transport registered for scheme {:?}", uri.scheme()))
        })
    }

    /// Registered schemes in order.
    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.transports.keys().map(String::as_str)
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry").field("schemes", &self.transports.keys()).finish()
    }
}
