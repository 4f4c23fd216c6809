//! Connection tasks.
//!
//! A [`PeerTask`] drives one socket-bearing state machine on behalf of the
//! broker: an accepted client [`Connection`], or a [`NetworkBridge`]. An
//! accepted connection whose peer advertises a bridge is promoted in place
//! to a mirror bridge; the task, its id and its socket stay the same.
//!
//! The loop is the same biased `select!` the failover client uses:
//! cancellation, commands, connect outcomes, socket events, timer.

use std::{collections::VecDeque, sync::Arc, time::Instant};

use tessera_core::{
    TransportError,
    bridge::{BridgeAction, BridgeEvent, BridgeStatus, NetworkBridge},
    connection::{Connection, ConnectionAction},
    dispatch::ConnectionId,
    env::Environment,
    transport::TransportStream,
    uri::BrokerUri,
    wire_format::WireFormatCapabilities,
};
use tessera_net::socket::{ConnectOutcome, Socket, SocketEvent, Tagged, spawn_connect};
use tessera_proto::{
    Frame, Payload,
    payloads::{
        control::{BrokerInfo, NetworkAdvert},
        message::Message,
    },
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::broker::{BridgeEntry, Shared};

/// Socket tag of an accepted connection. A mirror bridge keeps it as its
/// attempt id.
const ACCEPTED_TAG: u64 = 0;

/// Instruction for a connection task.
#[derive(Debug)]
pub(crate) enum PeerCommand {
    /// Write a control frame to a client
    Send(Frame),
    /// Offer a message to a bridge
    Forward(Message),
    /// Send a refreshed advertisement over a bridge
    Announce(BrokerInfo),
    /// Close and exit
    Stop,
}

enum Role {
    Client { connector: String, connection: Connection },
    Bridge { key: String, bridge: NetworkBridge },
    Finished,
}

pub(crate) struct PeerTask<E> {
    shared: Arc<Shared<E>>,
    id: ConnectionId,
    role: Role,
    socket: Option<Socket<u64>>,
    connecting: Option<(u64, JoinHandle<()>)>,
    sockets: mpsc::UnboundedSender<Tagged<u64>>,
    connects: mpsc::UnboundedSender<ConnectOutcome<u64>>,
}

type Inputs = (mpsc::UnboundedReceiver<Tagged<u64>>, mpsc::UnboundedReceiver<ConnectOutcome<u64>>);

impl<E> PeerTask<E>
where
    E: Environment<Instant = Instant>,
{
    fn new(shared: &Arc<Shared<E>>, id: ConnectionId, role: Role) -> (Self, Inputs) {
        let (sockets, sockets_rx) = mpsc::unbounded_channel();
        let (connects, connects_rx) = mpsc::unbounded_channel();
        let task = Self {
            shared: Arc::clone(shared),
            id,
            role,
            socket: None,
            connecting: None,
            sockets,
            connects,
        };
        (task, (sockets_rx, connects_rx))
    }

    /// Register an accepted stream with `connector` and start negotiating.
    pub(crate) fn spawn_client(shared: &Arc<Shared<E>>, connector: &str, stream: TransportStream) {
        let id = shared.next_connection_id();
        let now = shared.env.now();
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let accepted = {
            let mut guard = shared.lock();
            let state = &mut *guard;
            let Some(registry) = state.connectors.get_mut(connector) else {
                return;
            };
            let accepted = registry.accept(id, stream.remote_addr, now);
            if accepted.is_ok() {
                state.peers.insert(id, commands);
            }
            accepted
        };
        let (connection, actions) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(broker = %shared.name, %connector, %err, "cannot start negotiation");
                return;
            },
        };

        let role = Role::Client { connector: connector.to_string(), connection };
        let (mut task, (sockets_rx, connects_rx)) = Self::new(shared, id, role);
        task.socket = Some(Socket::spawn(ACCEPTED_TAG, stream, task.sockets.clone()));

        shared.tasks.spawn(async move {
            task.execute_client(actions);
            task.run(commands_rx, sockets_rx, connects_rx).await;
        });
    }

    /// Run an outbound bridge registered under `key`.
    pub(crate) fn spawn_bridge(
        shared: &Arc<Shared<E>>,
        id: ConnectionId,
        key: String,
        bridge: NetworkBridge,
        commands_rx: mpsc::UnboundedReceiver<PeerCommand>,
    ) {
        let (mut task, (sockets_rx, connects_rx)) = Self::new(shared, id, Role::Bridge { key, bridge });

        shared.tasks.spawn(async move {
            let now = task.shared.env.now();
            if let Role::Bridge { bridge, .. } = &mut task.role {
                let actions = bridge.start(now);
                task.execute_bridge(actions);
            }
            task.run(commands_rx, sockets_rx, connects_rx).await;
        });
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
        mut sockets: mpsc::UnboundedReceiver<Tagged<u64>>,
        mut connects: mpsc::UnboundedReceiver<ConnectOutcome<u64>>,
    ) {
        let cancel = self.shared.cancel.clone();

        while !matches!(self.role, Role::Finished) {
            let wakeup = self.next_wakeup();
            let env = self.shared.env.clone();
            let timer = async move {
                match wakeup {
                    Some(at) => env.sleep(at.saturating_duration_since(env.now())).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                () = cancel.cancelled() => self.stop(),
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => self.stop(),
                },
                Some(outcome) = connects.recv() => self.on_connect_outcome(outcome),
                Some((tag, event)) = sockets.recv() => self.on_socket_event(tag, event),
                () = timer => self.on_timer(),
            }
        }

        if let Some((_, pending)) = self.connecting.take() {
            pending.abort();
        }
        self.socket = None;
        trace!(broker = %self.shared.name, id = %self.id, "peer task stopped");
    }

    fn next_wakeup(&self) -> Option<Instant> {
        match &self.role {
            Role::Client { connection, .. } => connection.next_wakeup(),
            Role::Bridge { bridge, .. } => bridge.next_wakeup(),
            Role::Finished => None,
        }
    }

    fn on_command(&mut self, command: PeerCommand) {
        let now = self.shared.env.now();
        match command {
            PeerCommand::Send(frame) => self.client_send(frame),
            PeerCommand::Forward(message) => {
                if let Role::Bridge { bridge, .. } = &mut self.role {
                    let actions = bridge.forward(&message, now);
                    self.execute_bridge(actions);
                }
            },
            PeerCommand::Announce(info) => {
                if let Role::Bridge { bridge, .. } = &mut self.role {
                    let actions = bridge.announce(info, now);
                    self.execute_bridge(actions);
                }
            },
            PeerCommand::Stop => self.stop(),
        }
    }

    fn on_connect_outcome(&mut self, outcome: ConnectOutcome<u64>) {
        let ConnectOutcome { tag: attempt, result } = outcome;
        if self.connecting.as_ref().is_some_and(|(pending, _)| *pending == attempt) {
            self.connecting = None;
        }

        let now = self.shared.env.now();
        let Role::Bridge { bridge, .. } = &mut self.role else {
            return;
        };
        let actions = match result {
            Ok(stream) => {
                if bridge.status() != BridgeStatus::Connecting || bridge.attempt() != attempt {
                    debug!(bridge = %bridge.name(), attempt, "discarding stale connection");
                    return;
                }
                self.socket = Some(Socket::spawn(attempt, stream, self.sockets.clone()));
                bridge.on_connected(attempt, now)
            },
            Err(err) => bridge.on_connect_failed(attempt, &TransportError::from(err), now),
        };
        self.execute_bridge(actions);
    }

    fn on_socket_event(&mut self, tag: u64, event: SocketEvent) {
        let now = self.shared.env.now();
        match &mut self.role {
            Role::Client { connection, .. } => {
                if tag != ACCEPTED_TAG {
                    return;
                }
                let result = match event {
                    SocketEvent::Frame(frame) => connection.handle_frame(&frame, now),
                    SocketEvent::Closed(err) => Err(err),
                };
                match result {
                    Ok(actions) => self.execute_client(actions),
                    Err(err) => {
                        connection.fail();
                        self.finish_client(err);
                    },
                }
            },
            Role::Bridge { bridge, .. } => {
                let actions = match event {
                    SocketEvent::Frame(frame) => bridge.handle_frame(tag, &frame, now),
                    SocketEvent::Closed(err) => bridge.on_socket_error(tag, err, now),
                };
                self.execute_bridge(actions);
            },
            Role::Finished => {},
        }
    }

    fn on_timer(&mut self) {
        let now = self.shared.env.now();
        match &mut self.role {
            Role::Client { connection, .. } => {
                let actions = connection.tick(now);
                self.execute_client(actions);
            },
            Role::Bridge { bridge, .. } => {
                let actions = bridge.tick(now);
                self.execute_bridge(actions);
            },
            Role::Finished => {},
        }
    }

    fn stop(&mut self) {
        let now = self.shared.env.now();
        match &mut self.role {
            Role::Client { connection, .. } => {
                let actions = connection.close("broker shutdown", now);
                self.execute_client(actions);
                if !matches!(self.role, Role::Finished) {
                    self.finish_client(TransportError::Closed);
                }
            },
            Role::Bridge { bridge, .. } => {
                let actions = bridge.stop(now);
                self.execute_bridge(actions);
                self.finish_bridge();
            },
            Role::Finished => {},
        }
    }

    fn write(&self, frame: Frame) {
        match &self.socket {
            Some(socket) => {
                socket.send(frame);
            },
            None => trace!(id = %self.id, "no socket for outbound frame"),
        }
    }

    fn execute_client(&mut self, actions: Vec<ConnectionAction>) {
        for action in actions {
            match action {
                ConnectionAction::SendFrame(frame) => self.write(frame),
                ConnectionAction::Established(wire_format) => self.client_established(wire_format),
                ConnectionAction::Deliver(frame) => self.client_deliver(&frame),
                ConnectionAction::Close { error } => {
                    self.finish_client(error.unwrap_or(TransportError::Closed));
                    return;
                },
            }
            if !matches!(self.role, Role::Client { .. }) {
                return;
            }
        }
    }

    fn client_established(&mut self, wire_format: WireFormatCapabilities) {
        let Role::Client { connector, .. } = &self.role else {
            return;
        };
        let now = self.shared.env.now();
        let established = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let established = state
                .connectors
                .get_mut(connector.as_str())
                .and_then(|registry| registry.on_established(self.id, wire_format, &state.topology, now));
            state.clients_changed();
            established
        };
        let Some((info, broker_list)) = established else {
            return;
        };

        self.shared.dispatch.connection_established(&info);
        if let Some(frame) = broker_list {
            self.client_send(frame);
        }
    }

    fn client_send(&mut self, frame: Frame) {
        let now = self.shared.env.now();
        let Role::Client { connection, .. } = &mut self.role else {
            return;
        };
        match connection.send(frame, now) {
            Ok(frame) => self.write(frame),
            Err(err) => debug!(id = %self.id, %err, "dropping frame for client"),
        }
    }

    fn client_deliver(&mut self, frame: &Frame) {
        match Payload::from_frame(frame) {
            Ok(Payload::Message(message)) => {
                self.shared.dispatch.message_received(self.id, &message);
                self.shared.lock().route(&message, Some(self.id));
            },
            Ok(Payload::BrokerInfo(info)) => match info.network.clone() {
                Some(advert) => self.promote(&advert, info),
                None => debug!(id = %self.id, broker = %info.broker_name, "ignoring broker info without bridge"),
            },
            Ok(_) => trace!(id = %self.id, opcode = frame.header.opcode(), "ignoring frame"),
            Err(err) => warn!(id = %self.id, %err, "dropping malformed frame"),
        }
    }

    /// The peer is a broker bridging to us. Turn this connection into the
    /// accepting side of its bridge.
    fn promote(&mut self, advert: &NetworkAdvert, remote: BrokerInfo) {
        let Role::Client { connector, connection } = &self.role else {
            return;
        };
        let now = self.shared.env.now();
        let key = format!("{}@{}", advert.bridge_name, remote.broker_name);
        let remote_name = remote.broker_name.clone();

        let (bridge, actions) =
            match NetworkBridge::mirror(advert, self.shared.name.clone(), remote, connection.clone(), now) {
                Ok(mirrored) => mirrored,
                Err(err) => {
                    warn!(id = %self.id, bridge = %key, %err, "rejecting bridge");
                    self.finish_client(err);
                    return;
                },
            };

        let was_established = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let was_established = state
                .connectors
                .get_mut(connector.as_str())
                .is_some_and(|registry| registry.on_closed(self.id));
            let entry = BridgeEntry { id: self.id, status: bridge.status(), mirror: true };
            if let Some(previous) = state.bridges.insert(key.clone(), entry) {
                debug!(bridge = %key, previous = %previous.id, "replacing stale mirror");
                state.send(previous.id, PeerCommand::Stop);
            }
            if was_established {
                state.clients_changed();
            }
            was_established
        };
        if was_established {
            self.shared.dispatch.connection_lost(self.id, &TransportError::Closed);
        }

        info!(broker = %self.shared.name, id = %self.id, bridge = %key, remote = %remote_name, "accepted bridge");
        self.role = Role::Bridge { key, bridge };
        self.execute_bridge(actions);
    }

    fn finish_client(&mut self, error: TransportError) {
        let connector = match std::mem::replace(&mut self.role, Role::Finished) {
            Role::Client { connector, .. } => connector,
            other => {
                self.role = other;
                return;
            },
        };
        let was_established = {
            let mut state = self.shared.lock();
            state.peers.remove(&self.id);
            let was_established =
                state.connectors.get_mut(&connector).is_some_and(|registry| registry.on_closed(self.id));
            if was_established {
                state.clients_changed();
            }
            was_established
        };
        if was_established {
            info!(%connector, id = %self.id, %error, "client disconnected");
            self.shared.dispatch.connection_lost(self.id, &error);
        } else {
            debug!(%connector, id = %self.id, %error, "connection ended before negotiation");
        }
    }

    fn execute_bridge(&mut self, actions: Vec<BridgeAction>) {
        let now = self.shared.env.now();
        let mut queue = VecDeque::from(actions);

        while let Some(action) = queue.pop_front() {
            let Role::Bridge { key, bridge } = &mut self.role else {
                return;
            };
            match action {
                BridgeAction::Connect { uri, attempt } => self.open(uri, attempt),
                BridgeAction::Send(frame) => self.write(frame),
                BridgeAction::Disconnect { attempt } => {
                    if self.socket.as_ref().is_some_and(|socket| socket.tag() == attempt) {
                        self.socket = None;
                    }
                    if self.connecting.as_ref().is_some_and(|(pending, _)| *pending == attempt) {
                        if let Some((_, pending)) = self.connecting.take() {
                            pending.abort();
                        }
                    }
                },
                BridgeAction::Announce => {
                    let info = self.shared.lock().topology.advertise(key);
                    queue.extend(bridge.announce(info, now));
                },
                BridgeAction::Deliver(message) => {
                    self.shared.dispatch.message_received(self.id, &message);
                    self.shared.lock().route(&message, Some(self.id));
                },
                BridgeAction::Event(event) => {
                    let mut guard = self.shared.lock();
                    let state = &mut *guard;
                    if !state.owns_bridge(key, self.id) {
                        continue;
                    }
                    let change = match &event {
                        BridgeEvent::Up { remote } | BridgeEvent::PeerInfo { remote } => {
                            state.topology.bridge_up(key, remote)
                        },
                        BridgeEvent::Down { .. } => state.topology.bridge_down(key),
                    };
                    if !change.is_empty() {
                        info!(broker = %self.shared.name, bridge = %key, added = ?change.added, removed = ?change.removed, "membership changed");
                    }
                    state.membership_changed(&change);
                },
            }
        }

        self.sync_bridge();
    }

    fn open(&mut self, uri: BrokerUri, attempt: u64) {
        let transport = match self.shared.registry.resolve(&uri) {
            Ok(transport) => transport,
            Err(err) => {
                let now = self.shared.env.now();
                if let Role::Bridge { bridge, .. } = &mut self.role {
                    let actions = bridge.on_connect_failed(attempt, &err, now);
                    self.execute_bridge(actions);
                }
                return;
            },
        };
        if let Some((_, previous)) = self.connecting.take() {
            previous.abort();
        }
        let pending = spawn_connect(attempt, transport, uri, self.connects.clone());
        self.connecting = Some((attempt, pending));
    }

    fn sync_bridge(&mut self) {
        let Role::Bridge { key, bridge } = &self.role else {
            return;
        };
        let status = bridge.status();
        if let Some(entry) = self.shared.lock().bridges.get_mut(key) {
            if entry.id == self.id {
                entry.status = status;
            }
        }
        if bridge.is_mirror() && status == BridgeStatus::Stopped {
            self.finish_bridge();
        }
    }

    fn finish_bridge(&mut self) {
        let key = match std::mem::replace(&mut self.role, Role::Finished) {
            Role::Bridge { key, .. } => key,
            other => {
                self.role = other;
                return;
            },
        };
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        state.peers.remove(&self.id);
        if state.owns_bridge(&key, self.id) {
            state.bridges.remove(&key);
            let change = state.topology.bridge_down(&key);
            state.membership_changed(&change);
        }
        debug!(broker = %self.shared.name, bridge = %key, "bridge task finished");
    }
}
