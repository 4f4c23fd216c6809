//! Socket pump tasks.
//!
//! A [`Socket`] owns the two halves of a [`TransportStream`]:
//!
//! - a reader task decodes frames and forwards them, tagged, to the
//!   driver's event channel
//! - a writer task drains an unbounded queue, so frames leave in the order
//!   the state machine produced them
//!
//! Dropping the handle aborts the reader at once. The writer finishes the
//! frames already queued (a close notice, typically) and shuts the stream
//! down.

use std::{io, net::SocketAddr, sync::Arc};

use tessera_core::{
    TransportError,
    transport::{BoxedReader, BoxedWriter, Transport, TransportStream},
    uri::BrokerUri,
};
use tessera_proto::Frame;
use tokio::{io::AsyncWriteExt, sync::mpsc, task::JoinHandle};
use tracing::{debug, trace};

use crate::codec::{read_frame, write_frame};

/// Something a socket observed.
#[derive(Debug)]
pub enum SocketEvent {
    /// A complete frame arrived
    Frame(Frame),
    /// The stream ended or failed; no further events follow from the reader
    Closed(TransportError),
}

/// Event tagged with the id of the socket that produced it.
///
/// Drivers tag sockets with the attempt id of their state machine, so
/// events from a replaced socket are recognised as stale.
pub type Tagged<T> = (T, SocketEvent);

/// Handle to a pumped socket.
#[derive(Debug)]
pub struct Socket<T> {
    tag: T,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Frame>,
    reader: JoinHandle<()>,
}

impl<T> Socket<T>
where
    T: Copy + Send + std::fmt::Debug + 'static,
{
    /// Start pumping `stream`. Inbound events go to `events`.
    pub fn spawn(tag: T, stream: TransportStream, events: mpsc::UnboundedSender<Tagged<T>>) -> Self {
        let TransportStream { reader, writer, remote_addr, local_addr } = stream;
        let (outbound, queue) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(tag, reader, events.clone()));
        tokio::spawn(write_loop(tag, writer, queue, events));

        debug!(?tag, %remote_addr, "socket started");
        Self { tag, remote_addr, local_addr, outbound, reader }
    }

    /// Tag given at spawn time
    pub fn tag(&self) -> T {
        self.tag
    }

    /// Peer address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue `frame` for writing. Returns false once the writer has gone;
    /// the reader reports the cause.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

impl<T> Drop for Socket<T> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Result of a connect started with [`spawn_connect`].
#[derive(Debug)]
pub struct ConnectOutcome<T> {
    /// Tag given at spawn time
    pub tag: T,
    /// The stream, or why the connect failed
    pub result: io::Result<TransportStream>,
}

/// Connect to `uri` in the background and report to `outcomes`.
///
/// Aborting the returned handle cancels the connect; no outcome is sent
/// then.
pub fn spawn_connect<T>(
    tag: T,
    transport: Arc<dyn Transport>,
    uri: BrokerUri,
    outcomes: mpsc::UnboundedSender<ConnectOutcome<T>>,
) -> JoinHandle<()>
where
    T: Send + 'static,
{
    tokio::spawn(async move {
        let result = transport.connect(&uri).await;
        let _ = outcomes.send(ConnectOutcome { tag, result });
    })
}

async fn read_loop<T>(tag: T, mut reader: BoxedReader, events: mpsc::UnboundedSender<Tagged<T>>)
where
    T: Copy + std::fmt::Debug,
{
    loop {
        let event = match read_frame(&mut reader).await {
            Ok(Some(frame)) => SocketEvent::Frame(frame),
            Ok(None) => SocketEvent::Closed(TransportError::Socket("connection closed by peer".into())),
            Err(err) => SocketEvent::Closed(err),
        };
        let closed = matches!(event, SocketEvent::Closed(_));
        if let SocketEvent::Closed(err) = &event {
            debug!(?tag, %err, "socket reader finished");
        }
        if events.send((tag, event)).is_err() || closed {
            return;
        }
    }
}

async fn write_loop<T>(
    tag: T,
    mut writer: BoxedWriter,
    mut queue: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<Tagged<T>>,
) where
    T: Copy + std::fmt::Debug,
{
    while let Some(frame) = queue.recv().await {
        trace!(?tag, opcode = frame.header.opcode(), len = frame.payload.len(), "write");
        if let Err(err) = write_frame(&mut writer, &frame).await {
            debug!(?tag, %err, "socket writer failed");
            let _ = events.send((tag, SocketEvent::Closed(err)));
            return;
        }
    }
    let _ = writer.shutdown().await;
}
