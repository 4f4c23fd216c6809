//! Turmoil-based Transport implementation.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tessera_core::{
    transport::{Transport, TransportListener, TransportRegistry, TransportStream},
    uri::BrokerUri,
};
use turmoil::net::{TcpListener, TcpStream};

/// `tcp://` over turmoil's simulated TCP.
///
/// URI hosts are turmoil host names, so `tcp://broker-b:61616` reaches the
/// host registered as `broker-b`. Listeners bind every interface of the
/// current host; the URI host is only what the broker advertises.
///
/// Turmoil does not allocate ephemeral listen ports; connector URIs in a
/// simulation carry explicit ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimTransport;

impl SimTransport {
    fn into_stream(stream: TcpStream) -> io::Result<TransportStream> {
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(TransportStream {
            reader: Box::new(reader),
            writer: Box::new(writer),
            remote_addr,
            local_addr,
        })
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn connect(&self, uri: &BrokerUri) -> io::Result<TransportStream> {
        let stream = TcpStream::connect(uri.authority()).await?;
        Self::into_stream(stream)
    }

    async fn bind(&self, uri: &BrokerUri) -> io::Result<Box<dyn TransportListener>> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", uri.port())).await?;
        Ok(Box::new(SimListener { listener }))
    }
}

struct SimListener {
    listener: TcpListener,
}

#[async_trait]
impl TransportListener for SimListener {
    async fn accept(&self) -> io::Result<TransportStream> {
        let (stream, _) = self.listener.accept().await?;
        SimTransport::into_stream(stream)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Registry resolving `tcp` to [`SimTransport`].
pub fn sim_registry() -> TransportRegistry {
    TransportRegistry::new().with("tcp", Arc::new(SimTransport))
}
