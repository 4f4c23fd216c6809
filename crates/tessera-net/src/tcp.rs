//! Production TCP transport.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tessera_core::{
    transport::{Transport, TransportListener, TransportStream},
    uri::BrokerUri,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// `tcp://` transport over tokio sockets.
///
/// Nagle is disabled on every stream; frames are small and flushed one at
/// a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    fn into_stream(stream: TcpStream) -> io::Result<TransportStream> {
        stream.set_nodelay(true)?;
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(TransportStream {
            reader: Box::new(reader),
            writer: Box::new(writer),
            remote_addr,
            local_addr,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, uri: &BrokerUri) -> io::Result<TransportStream> {
        let stream = TcpStream::connect(uri.authority()).await?;
        Self::into_stream(stream)
    }

    async fn bind(&self, uri: &BrokerUri) -> io::Result<Box<dyn TransportListener>> {
        let listener = TcpListener::bind(uri.authority()).await?;
        debug!(%uri, local = ?listener.local_addr(), "listening");
        Ok(Box::new(TcpAcceptor { listener }))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl TransportListener for TcpAcceptor {
    async fn accept(&self) -> io::Result<TransportStream> {
        let (stream, _) = self.listener.accept().await?;
        TcpTransport::into_stream(stream)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
