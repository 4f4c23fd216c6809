//! Async driver for [`FailoverTransport`].
//!
//! The driver is a single task that owns the state machine, the live
//! socket and at most one pending connect. It multiplexes five inputs with
//! a biased `select!`, so a run under simulation is reproducible:
//!
//! 1. cancellation (client dropped)
//! 2. commands from the [`FailoverClient`] handle
//! 3. connect outcomes, tagged with the attempt id
//! 4. socket events, tagged with the attempt id
//! 5. the state machine's next deadline
//!
//! Every input becomes a state machine call, and every returned action is
//! executed before the next input is taken.

use std::time::Instant;

use tessera_core::{
    TransportError,
    env::Environment,
    failover::{FailoverAction, FailoverPhase, FailoverTransport, TransportEvent},
    transport::TransportRegistry,
    uri::{BrokerUri, FailoverUri},
    wire_format::WireFormatCapabilities,
};
use tessera_net::socket::{ConnectOutcome, Socket, SocketEvent, Tagged, spawn_connect};
use tessera_proto::{Frame, Payload, payloads::message::Message};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ClientError;

/// What the application receives from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connection lifecycle transition
    Transport(TransportEvent),
    /// Inbound application frame
    Frame(Frame),
}

/// Snapshot of the driver's state.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStatus {
    /// Failover phase
    pub phase: FailoverPhase,
    /// Broker of the current attempt or connection
    pub uri: Option<BrokerUri>,
    /// Negotiated capabilities when connected
    pub negotiated: Option<WireFormatCapabilities>,
    /// Frames waiting for a connection
    pub buffered: usize,
    /// Candidate list in preference order
    pub candidates: Vec<BrokerUri>,
}

enum Command {
    Send(Frame),
    Status(oneshot::Sender<ClientStatus>),
    Close(oneshot::Sender<usize>),
}

/// Handle to a running failover client.
///
/// Dropping the handle stops the driver; [`close`](Self::close) does the
/// same but also reports how many buffered frames were never sent.
#[derive(Debug)]
pub struct FailoverClient {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl FailoverClient {
    /// Parse a `failover:(...)` URI and start connecting.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Uri` or `ClientError::Transport` for invalid
    /// URIs or options. Nothing is spawned in that case.
    pub fn connect<E>(
        uri: &str,
        env: E,
        registry: TransportRegistry,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError>
    where
        E: Environment<Instant = Instant>,
    {
        let uri = FailoverUri::parse(uri)?;
        for candidate in &uri.uris {
            registry.resolve(candidate)?;
        }
        let transport = FailoverTransport::from_uri(&uri)?;
        Ok(Self::spawn(transport, env, registry))
    }

    /// Start driving an already configured state machine.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn<E>(
        transport: FailoverTransport,
        env: E,
        registry: TransportRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>)
    where
        E: Environment<Instant = Instant>,
    {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (sockets, sockets_rx) = mpsc::unbounded_channel();
        let (connects, connects_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let driver = Driver {
            env,
            registry,
            transport,
            socket: None,
            connecting: None,
            sockets,
            connects,
            events,
        };
        let task = tokio::spawn(driver.run(commands_rx, sockets_rx, connects_rx, cancel.clone()));

        (Self { commands, cancel, task }, events_rx)
    }

    /// Queue a frame. It is written now if connected, or replayed in order
    /// after the next successful connect.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Stopped` once the client is closed.
    pub fn send(&self, frame: Frame) -> Result<(), ClientError> {
        self.commands.send(Command::Send(frame)).map_err(|_| ClientError::Stopped)
    }

    /// Encode and queue an application message.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Protocol` if the message cannot be encoded and
    /// `ClientError::Stopped` once the client is closed.
    pub fn send_message(&self, message: Message) -> Result<(), ClientError> {
        self.send(Payload::Message(message).to_frame()?)
    }

    /// Current driver state.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Stopped` once the client is closed.
    pub async fn status(&self) -> Result<ClientStatus, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Status(reply)).map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    /// Close the client. Pending connects and backoff are cancelled at once.
    ///
    /// Returns the number of buffered frames that were discarded.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Stopped` if the driver already stopped.
    pub async fn close(self) -> Result<usize, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Close(reply)).map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    /// True once the driver task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for FailoverClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Driver<E> {
    env: E,
    registry: TransportRegistry,
    transport: FailoverTransport,
    socket: Option<Socket<u64>>,
    connecting: Option<(u64, JoinHandle<()>)>,
    sockets: mpsc::UnboundedSender<Tagged<u64>>,
    connects: mpsc::UnboundedSender<ConnectOutcome<u64>>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl<E> Driver<E>
where
    E: Environment<Instant = Instant>,
{
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut sockets: mpsc::UnboundedReceiver<Tagged<u64>>,
        mut connects: mpsc::UnboundedReceiver<ConnectOutcome<u64>>,
        cancel: CancellationToken,
    ) {
        let env = self.env.clone();
        let actions = self.transport.start(env.now(), || env.random_u64());
        self.execute(actions);

        loop {
            let wakeup = self.transport.next_wakeup();
            let timer_env = self.env.clone();
            let timer = async move {
                match wakeup {
                    Some(at) => timer_env.sleep(at.saturating_duration_since(timer_env.now())).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    let actions = self.transport.close(self.env.now());
                    self.execute(actions);
                    break;
                },
                command = commands.recv() => match command {
                    Some(Command::Send(frame)) => match self.transport.send(frame, self.env.now()) {
                        Ok(actions) => self.execute(actions),
                        Err(err) => warn!(%err, "dropping frame"),
                    },
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(self.status());
                    },
                    Some(Command::Close(reply)) => {
                        let undelivered = self.transport.buffered();
                        let actions = self.transport.close(self.env.now());
                        self.execute(actions);
                        let _ = reply.send(undelivered);
                        break;
                    },
                    None => {
                        let actions = self.transport.close(self.env.now());
                        self.execute(actions);
                        break;
                    },
                },
                Some(outcome) = connects.recv() => self.on_connect_outcome(outcome),
                Some((attempt, event)) = sockets.recv() => {
                    let now = self.env.now();
                    let actions = match event {
                        SocketEvent::Frame(frame) => self.transport.handle_frame(attempt, &frame, now),
                        SocketEvent::Closed(err) => self.transport.on_socket_error(attempt, err, now),
                    };
                    self.execute(actions);
                },
                () = timer => {
                    let actions = self.transport.tick(self.env.now());
                    self.execute(actions);
                },
            }
        }

        if let Some((_, pending)) = self.connecting.take() {
            pending.abort();
        }
        self.socket = None;
        debug!("failover driver stopped");
    }

    fn on_connect_outcome(&mut self, outcome: ConnectOutcome<u64>) {
        let ConnectOutcome { tag: attempt, result } = outcome;
        if self.connecting.as_ref().is_some_and(|(pending, _)| *pending == attempt) {
            self.connecting = None;
        }

        let now = self.env.now();
        let actions = match result {
            Ok(stream) => {
                if self.transport.phase() != FailoverPhase::Connecting
                    || self.transport.current_attempt() != Some(attempt)
                {
                    debug!(attempt, "discarding stale connection");
                    return;
                }
                self.socket = Some(Socket::spawn(attempt, stream, self.sockets.clone()));
                self.transport.on_connected(attempt, now)
            },
            Err(err) => self.transport.on_connect_failed(attempt, &TransportError::from(err), now),
        };
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<FailoverAction>) {
        for action in actions {
            match action {
                FailoverAction::Connect { uri, attempt } => self.open(uri, attempt),
                FailoverAction::Send(frame) => match &self.socket {
                    Some(socket) => {
                        socket.send(frame);
                    },
                    None => debug!("no socket for outbound frame"),
                },
                FailoverAction::Disconnect { attempt } => {
                    if self.socket.as_ref().is_some_and(|socket| socket.tag() == attempt) {
                        self.socket = None;
                    }
                    if self.connecting.as_ref().is_some_and(|(pending, _)| *pending == attempt) {
                        if let Some((_, pending)) = self.connecting.take() {
                            pending.abort();
                        }
                    }
                },
                FailoverAction::Deliver(frame) => {
                    let _ = self.events.send(ClientEvent::Frame(frame));
                },
                FailoverAction::Notify(event) => {
                    match &event {
                        TransportEvent::Connected { uri } | TransportEvent::Resumed { uri } => {
                            info!(%uri, "transport up");
                        },
                        TransportEvent::Interrupted { reason } => warn!(%reason, "transport interrupted"),
                        _ => {},
                    }
                    let _ = self.events.send(ClientEvent::Transport(event));
                },
            }
        }
    }

    fn open(&mut self, uri: BrokerUri, attempt: u64) {
        let transport = match self.registry.resolve(&uri) {
            Ok(transport) => transport,
            Err(err) => {
                let actions = self.transport.on_connect_failed(attempt, &err, self.env.now());
                self.execute(actions);
                return;
            },
        };
        if let Some((_, previous)) = self.connecting.take() {
            previous.abort();
        }

        let pending = spawn_connect(attempt, transport, uri, self.connects.clone());
        self.connecting = Some((attempt, pending));
    }

    fn status(&self) -> ClientStatus {
        ClientStatus {
            phase: self.transport.phase(),
            uri: self.transport.current_uri().cloned(),
            negotiated: self.transport.negotiated().copied(),
            buffered: self.transport.buffered(),
            candidates: self.transport.candidates().to_vec(),
        }
    }
}
