//! Broker-to-broker network bridge.
//!
//! A bridge is one logical link to one peer broker. The initiating side
//! dials the remote URI, negotiates the wire format, then both sides
//! exchange [`BrokerInfo`]. The bridge is `Up` once the remote's info has
//! arrived.
//!
//! The accepting side of the socket learns from the initiator's
//! [`NetworkAdvert`] that the connection is a bridge and builds a mirror
//! with [`NetworkBridge::mirror`]. Traffic directions:
//!
//! | side | duplex | simplex |
//! |------|--------|---------|
//! | initiator | out + in | out |
//! | mirror | out + in | in |
//!
//! The initiator reconnects forever with exponential backoff. A mirror
//! stops when its socket goes away; the initiator re-creates it.
//!
//! Forwarding rules: the bridge must be up, the direction allowed, the
//! destination accepted by the filter, and the remote broker absent from
//! the message's `broker_path`. Forwarded messages carry the local broker
//! name appended to their path and the `BRIDGED` frame flag.

use std::time::{Duration, Instant};

use tessera_proto::{
    Frame, FrameFlags, FrameHeader, Opcode, Payload,
    payloads::{
        control::{BrokerInfo, NetworkAdvert},
        message::Message,
    },
};
use tracing::{debug, info, warn};

use crate::{
    backoff::{BackoffPolicy, ExponentialBackoff},
    connection::{Connection, ConnectionAction, ConnectionConfig, ConnectionPhase},
    destination::DestinationFilter,
    error::TransportError,
    uri::BrokerUri,
};

/// Bridge configuration (initiating side).
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Bridge name (unique per broker)
    pub name: String,
    /// Remote broker URI
    pub remote: BrokerUri,
    /// Carry both directions over this bridge
    pub duplex: bool,
    /// Only forward matching destinations
    pub destination_filter: Option<DestinationFilter>,
    /// Reconnect delays
    pub backoff: BackoffPolicy,
    /// Bound on a single socket connect
    pub connect_timeout: Duration,
    /// Per-connection settings
    pub connection: ConnectionConfig,
}

impl BridgeConfig {
    /// Simplex, unfiltered bridge with default timing.
    #[must_use]
    pub fn new(name: impl Into<String>, remote: BrokerUri) -> Self {
        Self {
            name: name.into(),
            remote,
            duplex: false,
            destination_filter: None,
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(5),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Bridge status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeStatus {
    /// No connection; waiting for the next attempt
    Down,
    /// Socket connect in flight
    Connecting,
    /// Negotiating or exchanging broker info
    Negotiating,
    /// Remote info received; traffic flows
    Up,
    /// Stopped for good
    Stopped,
}

/// Traffic direction relative to the local broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local to remote
    Outbound,
    /// Remote to local
    Inbound,
}

/// Status changes reported to the topology manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Remote info received for the first time on this connection
    Up {
        /// What the remote reported
        remote: BrokerInfo,
    },
    /// Remote re-advertised (peers changed)
    PeerInfo {
        /// What the remote reported
        remote: BrokerInfo,
    },
    /// Connection attempt failed or an up bridge went down
    Down {
        /// Why
        error: TransportError,
    },
}

/// Actions for the bridge driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeAction {
    /// Open a socket to `uri`. Report the result with `attempt`.
    Connect {
        /// Remote broker
        uri: BrokerUri,
        /// Attempt identifier
        attempt: u64,
    },
    /// Write this frame to the bridge socket
    Send(Frame),
    /// Drop the socket of `attempt`
    Disconnect {
        /// Attempt identifier
        attempt: u64,
    },
    /// Send the local advertisement through [`NetworkBridge::announce`]
    Announce,
    /// Inbound message for local routing
    Deliver(Message),
    /// Report to the topology manager
    Event(BridgeEvent),
}

#[derive(Debug, Clone)]
struct Dialer {
    remote: BrokerUri,
    backoff: ExponentialBackoff,
    connect_timeout: Duration,
    connection: ConnectionConfig,
    next_attempt: u64,
    retry_at: Option<Instant>,
}

#[derive(Debug, Clone)]
enum Role {
    Initiator(Dialer),
    Mirror,
}

/// Bridge state machine
#[derive(Debug, Clone)]
pub struct NetworkBridge {
    name: String,
    local_name: String,
    duplex: bool,
    filter: Option<DestinationFilter>,
    role: Role,
    status: BridgeStatus,
    connection: Option<Connection>,
    attempt: u64,
    since: Instant,
    handshake_timeout: Duration,
    remote: Option<BrokerInfo>,
}

impl NetworkBridge {
    /// Initiating side of a bridge, initially `Down`.
    #[must_use]
    pub fn new(config: BridgeConfig, local_name: impl Into<String>, now: Instant) -> Self {
        let handshake_timeout = config.connection.negotiation_timeout;
        Self {
            name: config.name,
            local_name: local_name.into(),
            duplex: config.duplex,
            filter: config.destination_filter,
            role: Role::Initiator(Dialer {
                remote: config.remote,
                backoff: ExponentialBackoff::new(config.backoff),
                connect_timeout: config.connect_timeout,
                connection: config.connection,
                next_attempt: 1,
                retry_at: None,
            }),
            status: BridgeStatus::Down,
            connection: None,
            attempt: 0,
            since: now,
            handshake_timeout,
            remote: None,
        }
    }

    /// Accepting side of a bridge, built from the initiator's
    /// advertisement on an already negotiated connection.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if `connection` is not connected and
    /// `Config` if the advertised filter does not parse.
    pub fn mirror(
        advert: &NetworkAdvert,
        local_name: impl Into<String>,
        remote: BrokerInfo,
        connection: Connection,
        now: Instant,
    ) -> Result<(Self, Vec<BridgeAction>), TransportError> {
        if connection.phase() != ConnectionPhase::Connected {
            return Err(TransportError::InvalidState {
                phase: connection.phase(),
                operation: "mirror bridge",
            });
        }
        let filter = advert
            .destination_filter
            .as_deref()
            .map(DestinationFilter::parse)
            .transpose()
            .map_err(|err| TransportError::Config(err.to_string()))?;

        let bridge = Self {
            name: advert.bridge_name.clone(),
            local_name: local_name.into(),
            duplex: advert.duplex,
            filter,
            role: Role::Mirror,
            status: BridgeStatus::Up,
            handshake_timeout: connection.config().negotiation_timeout,
            connection: Some(connection),
            attempt: 0,
            since: now,
            remote: Some(remote.clone()),
        };
        info!(bridge = %bridge.name, remote = %remote.broker_name, duplex = bridge.duplex, "mirror bridge up");

        Ok((bridge, vec![BridgeAction::Announce, BridgeAction::Event(BridgeEvent::Up { remote })]))
    }

    /// Bridge name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> BridgeStatus {
        self.status
    }

    /// True for the accepting side
    #[must_use]
    pub fn is_mirror(&self) -> bool {
        matches!(self.role, Role::Mirror)
    }

    /// Duplex flag
    #[must_use]
    pub fn is_duplex(&self) -> bool {
        self.duplex
    }

    /// Name of the remote broker, once known.
    #[must_use]
    pub fn remote_name(&self) -> Option<&str> {
        self.remote.as_ref().map(|info| info.broker_name.as_str())
    }

    /// Current attempt identifier
    #[must_use]
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// True if traffic may flow in `direction`.
    #[must_use]
    pub fn allows(&self, direction: Direction) -> bool {
        self.duplex
            || matches!(
                (&self.role, direction),
                (Role::Initiator(_), Direction::Outbound) | (Role::Mirror, Direction::Inbound)
            )
    }

    /// Start dialing (initiator only).
    pub fn start(&mut self, now: Instant) -> Vec<BridgeAction> {
        if self.status != BridgeStatus::Down {
            return vec![];
        }
        self.dial(now)
    }

    /// The socket for `attempt` is open.
    pub fn on_connected(&mut self, attempt: u64, now: Instant) -> Vec<BridgeAction> {
        if self.status != BridgeStatus::Connecting || attempt != self.attempt {
            return vec![BridgeAction::Disconnect { attempt }];
        }
        let Role::Initiator(dialer) = &self.role else {
            return vec![BridgeAction::Disconnect { attempt }];
        };

        let mut config = dialer.connection.clone();
        if let Ok(wire_format) = config.wire_format.apply_options(dialer.remote.options()) {
            config.wire_format = wire_format;
        }
        let mut connection = Connection::new(now, config);
        match connection.start(now) {
            Ok(actions) => {
                self.connection = Some(connection);
                self.set_status(BridgeStatus::Negotiating, now);
                self.absorb(actions, now)
            },
            Err(err) => self.lost(err, now),
        }
    }

    /// The socket connect for `attempt` failed.
    pub fn on_connect_failed(
        &mut self,
        attempt: u64,
        error: &TransportError,
        now: Instant,
    ) -> Vec<BridgeAction> {
        if self.status != BridgeStatus::Connecting || attempt != self.attempt {
            return vec![];
        }
        let Role::Initiator(dialer) = &self.role else {
            return vec![];
        };
        let error = TransportError::ClusterMemberUnreachable {
            uri: dialer.remote.to_string(),
            reason: error.to_string(),
        };
        self.lost(error, now)
    }

    /// The bridge socket of `attempt` failed or was closed.
    pub fn on_socket_error(
        &mut self,
        attempt: u64,
        error: TransportError,
        now: Instant,
    ) -> Vec<BridgeAction> {
        if attempt != self.attempt
            || !matches!(self.status, BridgeStatus::Negotiating | BridgeStatus::Up)
        {
            return vec![];
        }
        self.lost(error, now)
    }

    /// Process a frame read from the bridge socket of `attempt`.
    pub fn handle_frame(&mut self, attempt: u64, frame: &Frame, now: Instant) -> Vec<BridgeAction> {
        if attempt != self.attempt {
            return vec![];
        }
        let Some(connection) = self.connection.as_mut() else {
            return vec![];
        };
        match connection.handle_frame(frame, now) {
            Ok(actions) => self.absorb(actions, now),
            Err(err) => self.lost(err, now),
        }
    }

    /// Send the local advertisement. The initiator attaches its bridge
    /// settings so the remote can mirror it.
    pub fn announce(&mut self, mut info: BrokerInfo, now: Instant) -> Vec<BridgeAction> {
        if matches!(self.role, Role::Initiator(_)) {
            info.network = Some(NetworkAdvert {
                bridge_name: self.name.clone(),
                duplex: self.duplex,
                destination_filter: self.filter.as_ref().map(|f| f.as_str().to_string()),
            });
        }
        let Some(connection) = self.connection.as_mut() else {
            return vec![];
        };
        let frame = match Payload::BrokerInfo(info).to_frame() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(bridge = %self.name, %err, "cannot encode broker info");
                return vec![];
            },
        };
        match connection.send(frame, now) {
            Ok(frame) => vec![BridgeAction::Send(frame)],
            Err(_) => vec![],
        }
    }

    /// True if `message` would be forwarded to the remote broker now.
    #[must_use]
    pub fn should_forward(&self, message: &Message) -> bool {
        let Some(remote) = self.remote_name() else {
            return false;
        };
        self.status == BridgeStatus::Up
            && self.allows(Direction::Outbound)
            && !message.has_visited(remote)
            && self.filter.as_ref().is_none_or(|filter| filter.matches(&message.destination))
    }

    /// Forward `message` if eligible.
    pub fn forward(&mut self, message: &Message, now: Instant) -> Vec<BridgeAction> {
        if !self.should_forward(message) {
            return vec![];
        }

        let mut message = message.clone();
        if message.broker_path.last() != Some(&self.local_name) {
            message.broker_path.push(self.local_name.clone());
        }
        let mut header = FrameHeader::new(Opcode::Message);
        header.set_flags(FrameFlags::BRIDGED);

        let Some(connection) = self.connection.as_mut() else {
            return vec![];
        };
        match Payload::Message(message).into_frame(header) {
            Ok(frame) => match connection.send(frame, now) {
                Ok(frame) => vec![BridgeAction::Send(frame)],
                Err(_) => vec![],
            },
            Err(err) => {
                warn!(bridge = %self.name, %err, "cannot encode forwarded message");
                vec![]
            },
        }
    }

    /// Drive timers: reconnect backoff, connect timeout, handshake window,
    /// inactivity monitoring.
    pub fn tick(&mut self, now: Instant) -> Vec<BridgeAction> {
        match self.status {
            BridgeStatus::Down => {
                let due = match &self.role {
                    Role::Initiator(dialer) => dialer.retry_at.is_some_and(|at| now >= at),
                    Role::Mirror => false,
                };
                if due { self.dial(now) } else { vec![] }
            },
            BridgeStatus::Connecting => {
                let Role::Initiator(dialer) = &self.role else {
                    return vec![];
                };
                if now.saturating_duration_since(self.since) < dialer.connect_timeout {
                    return vec![];
                }
                let error = TransportError::Socket(format!(
                    "connect to {} timed out after {:?}",
                    dialer.remote, dialer.connect_timeout
                ));
                let attempt = self.attempt;
                self.on_connect_failed(attempt, &error, now)
            },
            BridgeStatus::Negotiating | BridgeStatus::Up => {
                if self.status == BridgeStatus::Negotiating
                    && now.saturating_duration_since(self.since) >= self.handshake_timeout
                {
                    let elapsed = now.saturating_duration_since(self.since);
                    return self.lost(TransportError::NegotiationTimeout { elapsed }, now);
                }
                let Some(connection) = self.connection.as_mut() else {
                    return vec![];
                };
                let actions = connection.tick(now);
                self.absorb(actions, now)
            },
            BridgeStatus::Stopped => vec![],
        }
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    #[must_use]
    pub fn next_wakeup(&self) -> Option<Instant> {
        match (self.status, &self.role) {
            (BridgeStatus::Down, Role::Initiator(dialer)) => dialer.retry_at,
            (BridgeStatus::Connecting, Role::Initiator(dialer)) => {
                Some(self.since + dialer.connect_timeout)
            },
            (BridgeStatus::Negotiating, _) => {
                let handshake = self.since + self.handshake_timeout;
                let connection = self.connection.as_ref().and_then(Connection::next_wakeup);
                Some(connection.map_or(handshake, |at| at.min(handshake)))
            },
            (BridgeStatus::Up, _) => self.connection.as_ref().and_then(Connection::next_wakeup),
            _ => None,
        }
    }

    /// Stop the bridge for good.
    pub fn stop(&mut self, now: Instant) -> Vec<BridgeAction> {
        if self.status == BridgeStatus::Stopped {
            return vec![];
        }
        let was_up = self.status == BridgeStatus::Up;
        let had_socket = matches!(
            self.status,
            BridgeStatus::Connecting | BridgeStatus::Negotiating | BridgeStatus::Up
        );

        let mut actions = Vec::new();
        if let Some(mut connection) = self.connection.take() {
            for action in connection.close("bridge stopped", now) {
                if let ConnectionAction::SendFrame(frame) = action {
                    actions.push(BridgeAction::Send(frame));
                }
            }
        }
        if had_socket {
            actions.push(BridgeAction::Disconnect { attempt: self.attempt });
        }
        if was_up {
            actions.push(BridgeAction::Event(BridgeEvent::Down { error: TransportError::Closed }));
        }
        if let Role::Initiator(dialer) = &mut self.role {
            dialer.retry_at = None;
        }
        self.remote = None;
        self.set_status(BridgeStatus::Stopped, now);
        actions
    }

    fn dial(&mut self, now: Instant) -> Vec<BridgeAction> {
        let Role::Initiator(dialer) = &mut self.role else {
            return vec![];
        };
        let attempt = dialer.next_attempt;
        dialer.next_attempt += 1;
        dialer.retry_at = None;
        let uri = dialer.remote.clone();

        self.attempt = attempt;
        self.set_status(BridgeStatus::Connecting, now);
        debug!(bridge = %self.name, %uri, attempt, "dialing");
        vec![BridgeAction::Connect { uri, attempt }]
    }

    fn absorb(&mut self, actions: Vec<ConnectionAction>, now: Instant) -> Vec<BridgeAction> {
        let mut out = Vec::new();
        for action in actions {
            match action {
                ConnectionAction::SendFrame(frame) => out.push(BridgeAction::Send(frame)),
                ConnectionAction::Established(_) => out.push(BridgeAction::Announce),
                ConnectionAction::Deliver(frame) => out.extend(self.inbound(&frame, now)),
                ConnectionAction::Close { error } => {
                    out.extend(self.lost(error.unwrap_or(TransportError::Closed), now));
                    break;
                },
            }
        }
        out
    }

    fn inbound(&mut self, frame: &Frame, now: Instant) -> Vec<BridgeAction> {
        match Payload::from_frame(frame) {
            Ok(Payload::BrokerInfo(info)) => {
                if info.broker_name == self.local_name {
                    return self.lost(
                        TransportError::Config(format!(
                            "bridge {} connects broker {} to itself",
                            self.name, self.local_name
                        )),
                        now,
                    );
                }
                self.remote = Some(info.clone());
                if self.status == BridgeStatus::Up {
                    return vec![BridgeAction::Event(BridgeEvent::PeerInfo { remote: info })];
                }
                if let Role::Initiator(dialer) = &mut self.role {
                    dialer.backoff.reset();
                }
                self.set_status(BridgeStatus::Up, now);
                info!(bridge = %self.name, remote = %info.broker_name, duplex = self.duplex, "bridge up");
                vec![BridgeAction::Event(BridgeEvent::Up { remote: info })]
            },
            Ok(Payload::Message(message)) => {
                if self.status != BridgeStatus::Up
                    || !self.allows(Direction::Inbound)
                    || message.has_visited(&self.local_name)
                {
                    debug!(bridge = %self.name, id = %message.message_id, "dropping inbound message");
                    return vec![];
                }
                vec![BridgeAction::Deliver(message)]
            },
            Ok(_) => vec![],
            Err(err) => {
                warn!(bridge = %self.name, %err, "dropping malformed frame");
                vec![]
            },
        }
    }

    fn lost(&mut self, error: TransportError, now: Instant) -> Vec<BridgeAction> {
        let mut actions = vec![BridgeAction::Disconnect { attempt: self.attempt }];
        if let Some(connection) = self.connection.as_mut() {
            connection.fail();
        }
        self.connection = None;
        self.remote = None;

        match &mut self.role {
            Role::Initiator(dialer) => {
                let delay = dialer.backoff.next_delay();
                dialer.retry_at = Some(now + delay);
                warn!(bridge = %self.name, %error, retry_in = ?delay, "bridge down");
                self.set_status(BridgeStatus::Down, now);
            },
            Role::Mirror => {
                info!(bridge = %self.name, %error, "mirror bridge down");
                self.set_status(BridgeStatus::Stopped, now);
            },
        }

        actions.push(BridgeAction::Event(BridgeEvent::Down { error }));
        actions
    }

    fn set_status(&mut self, status: BridgeStatus, now: Instant) {
        if self.status != status {
            self.status = status;
            self.since = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use tessera_proto::payloads::control::PeerBroker;

    use super::*;
    use crate::wire_format::WireFormatCapabilities;

    fn uri(s: &str) -> BrokerUri {
        BrokerUri::parse(s).expect("uri")
    }

    fn remote_info(name: &str) -> BrokerInfo {
        BrokerInfo {
            broker_name: name.into(),
            connector_uris: vec![format!("tcp://{name}:61616")],
            clients: 0,
            peers: vec![],
            network: None,
        }
    }

    fn local_info() -> BrokerInfo {
        remote_info("a")
    }

    fn frame(payload: Payload) -> Frame {
        payload.to_frame().expect("encode")
    }

    fn negotiation() -> Frame {
        frame(Payload::WireFormatInfo(WireFormatCapabilities::default().to_info()))
    }

    fn up_bridge(config: BridgeConfig, now: Instant) -> NetworkBridge {
        let mut bridge = NetworkBridge::new(config, "a", now);
        let actions = bridge.start(now);
        let [BridgeAction::Connect { attempt, .. }] = actions.as_slice() else {
            panic!("expected connect, got {actions:?}");
        };
        let attempt = *attempt;
        bridge.on_connected(attempt, now);
        let actions = bridge.handle_frame(attempt, &negotiation(), now);
        assert_eq!(actions, vec![BridgeAction::Announce]);
        bridge.announce(local_info(), now);
        let actions = bridge.handle_frame(attempt, &frame(Payload::BrokerInfo(remote_info("b"))), now);
        assert!(matches!(actions.as_slice(), [BridgeAction::Event(BridgeEvent::Up { .. })]));
        bridge
    }

    fn connected_connection(now: Instant) -> Connection {
        let mut connection = Connection::new(now, ConnectionConfig::default());
        connection.start(now).expect("start");
        connection.handle_frame(&negotiation(), now).expect("negotiate");
        connection
    }

    fn sent_messages(actions: &[BridgeAction]) -> Vec<(Message, FrameFlags)> {
        actions
            .iter()
            .filter_map(|action| match action {
                BridgeAction::Send(frame) => match Payload::from_frame(frame) {
                    Ok(Payload::Message(message)) => Some((message, frame.header.flags())),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn handshake_brings_bridge_up() {
        let now = Instant::now();
        let bridge = up_bridge(BridgeConfig::new("to-b", uri("tcp://b:61616")), now);
        assert_eq!(bridge.status(), BridgeStatus::Up);
        assert_eq!(bridge.remote_name(), Some("b"));
    }

    #[test]
    fn initiator_announce_carries_network_advert() {
        let now = Instant::now();
        let config = BridgeConfig {
            duplex: true,
            destination_filter: Some(DestinationFilter::parse("orders.>").expect("filter")),
            ..BridgeConfig::new("to-b", uri("tcp://b:61616"))
        };
        let mut bridge = up_bridge(config, now);

        let actions = bridge.announce(local_info(), now);
        let [BridgeAction::Send(frame)] = actions.as_slice() else {
            panic!("expected one frame, got {actions:?}");
        };
        let Ok(Payload::BrokerInfo(info)) = Payload::from_frame(frame) else {
            panic!("expected broker info");
        };
        assert_eq!(info.network, Some(NetworkAdvert {
            bridge_name: "to-b".into(),
            duplex: true,
            destination_filter: Some("orders.>".into()),
        }));
    }

    #[test]
    fn unfiltered_bridge_forwards_everything_and_stamps_path() {
        let now = Instant::now();
        let mut bridge = up_bridge(BridgeConfig::new("to-b", uri("tcp://b:61616")), now);

        let actions = bridge.forward(&Message::new("m1", "orders.new", b"x".to_vec()), now);
        let sent = sent_messages(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.broker_path, vec!["a".to_string()]);
        assert!(sent[0].1.contains(FrameFlags::BRIDGED));
    }

    #[test]
    fn filtered_bridge_forwards_only_matching_destinations() {
        let now = Instant::now();
        let config = BridgeConfig {
            destination_filter: Some(DestinationFilter::parse("orders.>").expect("filter")),
            ..BridgeConfig::new("to-b", uri("tcp://b:61616"))
        };
        let mut bridge = up_bridge(config, now);

        assert!(bridge.should_forward(&Message::new("m1", "orders.new", vec![])));
        assert!(!bridge.should_forward(&Message::new("m2", "billing.new", vec![])));
        assert!(bridge.forward(&Message::new("m2", "billing.new", vec![]), now).is_empty());
    }

    #[test]
    fn never_forwards_back_to_a_broker_on_the_path() {
        let now = Instant::now();
        let bridge = up_bridge(BridgeConfig::new("to-b", uri("tcp://b:61616")), now);

        let mut message = Message::new("m1", "orders", vec![]);
        message.broker_path = vec!["b".into()];
        assert!(!bridge.should_forward(&message));
    }

    #[test]
    fn simplex_initiator_drops_inbound_messages() {
        let now = Instant::now();
        let mut bridge = up_bridge(BridgeConfig::new("to-b", uri("tcp://b:61616")), now);
        let attempt = bridge.attempt();

        let mut message = Message::new("m1", "orders", vec![]);
        message.broker_path = vec!["b".into()];
        let actions = bridge.handle_frame(attempt, &frame(Payload::Message(message)), now);
        assert!(actions.is_empty());
    }

    #[test]
    fn duplex_initiator_delivers_inbound_messages() {
        let now = Instant::now();
        let config = BridgeConfig { duplex: true, ..BridgeConfig::new("to-b", uri("tcp://b:61616")) };
        let mut bridge = up_bridge(config, now);
        let attempt = bridge.attempt();

        let mut message = Message::new("m1", "orders", vec![]);
        message.broker_path = vec!["b".into()];
        let actions = bridge.handle_frame(attempt, &frame(Payload::Message(message.clone())), now);
        assert_eq!(actions, vec![BridgeAction::Deliver(message)]);
    }

    #[test]
    fn simplex_mirror_only_receives() {
        let now = Instant::now();
        let advert = NetworkAdvert { bridge_name: "to-a".into(), duplex: false, destination_filter: None };
        let (mirror, actions) =
            NetworkBridge::mirror(&advert, "a", remote_info("b"), connected_connection(now), now)
                .expect("mirror");

        assert_eq!(actions[0], BridgeAction::Announce);
        assert!(mirror.is_mirror());
        assert!(mirror.allows(Direction::Inbound));
        assert!(!mirror.allows(Direction::Outbound));
        assert!(!mirror.should_forward(&Message::new("m1", "orders", vec![])));
    }

    #[test]
    fn duplex_mirror_forwards_with_advertised_filter() {
        let now = Instant::now();
        let advert = NetworkAdvert {
            bridge_name: "to-a".into(),
            duplex: true,
            destination_filter: Some("orders.*".into()),
        };
        let (mut mirror, _) =
            NetworkBridge::mirror(&advert, "a", remote_info("b"), connected_connection(now), now)
                .expect("mirror");

        assert_eq!(sent_messages(&mirror.forward(&Message::new("m1", "orders.new", vec![]), now)).len(), 1);
        assert!(mirror.forward(&Message::new("m2", "audit.new", vec![]), now).is_empty());
    }

    #[test]
    fn mirror_with_invalid_filter_is_rejected() {
        let now = Instant::now();
        let advert = NetworkAdvert {
            bridge_name: "to-a".into(),
            duplex: true,
            destination_filter: Some("orders..new".into()),
        };
        let result = NetworkBridge::mirror(&advert, "a", remote_info("b"), connected_connection(now), now);
        assert!(matches!(result, Err(TransportError::Config(_))));
    }

    #[test]
    fn connect_failure_retries_with_backoff_forever() {
        let t0 = Instant::now();
        let mut bridge = NetworkBridge::new(BridgeConfig::new("to-b", uri("tcp://b:61616")), "a", t0);
        let refused = TransportError::Socket("refused".into());

        let mut now = t0;
        let mut delays = Vec::new();
        for _ in 0..7 {
            let actions = match bridge.next_wakeup() {
                None => bridge.start(now),
                Some(at) => {
                    delays.push(at - now);
                    now = at;
                    bridge.tick(now)
                },
            };
            let [BridgeAction::Connect { attempt, .. }] = actions.as_slice() else {
                panic!("expected connect, got {actions:?}");
            };
            let actions = bridge.on_connect_failed(*attempt, &refused, now);
            assert!(matches!(
                actions.last(),
                Some(BridgeAction::Event(BridgeEvent::Down {
                    error: TransportError::ClusterMemberUnreachable { .. }
                }))
            ));
        }

        let secs: Vec<u64> = delays.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30]);
    }

    #[test]
    fn lost_bridge_reports_down_and_redials() {
        let t0 = Instant::now();
        let mut bridge = up_bridge(BridgeConfig::new("to-b", uri("tcp://b:61616")), t0);
        let attempt = bridge.attempt();

        let actions = bridge.on_socket_error(attempt, TransportError::Socket("reset".into()), t0);
        assert_eq!(actions[0], BridgeAction::Disconnect { attempt });
        assert!(matches!(actions[1], BridgeAction::Event(BridgeEvent::Down { .. })));
        assert_eq!(bridge.status(), BridgeStatus::Down);

        let actions = bridge.tick(t0 + Duration::from_secs(1));
        assert!(matches!(actions.as_slice(), [BridgeAction::Connect { .. }]));
    }

    #[test]
    fn peer_info_refresh_is_reported() {
        let now = Instant::now();
        let mut bridge = up_bridge(BridgeConfig::new("to-b", uri("tcp://b:61616")), now);
        let attempt = bridge.attempt();

        let mut info = remote_info("b");
        info.peers.push(PeerBroker { broker_name: "c".into(), connector_uris: vec![], clients: 3 });
        let actions = bridge.handle_frame(attempt, &frame(Payload::BrokerInfo(info.clone())), now);
        assert_eq!(actions, vec![BridgeAction::Event(BridgeEvent::PeerInfo { remote: info })]);
    }

    #[test]
    fn handshake_without_broker_info_times_out() {
        let t0 = Instant::now();
        let mut bridge = NetworkBridge::new(BridgeConfig::new("to-b", uri("tcp://b:61616")), "a", t0);
        let attempt = bridge.attempt() + 1;
        bridge.start(t0);
        bridge.on_connected(attempt, t0);
        bridge.handle_frame(attempt, &negotiation(), t0);

        let actions = bridge.tick(t0 + Duration::from_secs(15));
        assert!(matches!(
            actions.last(),
            Some(BridgeAction::Event(BridgeEvent::Down { error: TransportError::NegotiationTimeout { .. } }))
        ));
    }

    #[test]
    fn stop_cancels_retry() {
        let t0 = Instant::now();
        let mut bridge = up_bridge(BridgeConfig::new("to-b", uri("tcp://b:61616")), t0);

        let actions = bridge.stop(t0);
        assert!(actions.iter().any(|a| matches!(a, BridgeAction::Disconnect { .. })));
        assert!(actions.contains(&BridgeAction::Event(BridgeEvent::Down { error: TransportError::Closed })));
        assert_eq!(bridge.status(), BridgeStatus::Stopped);
        assert_eq!(bridge.next_wakeup(), None);
        assert!(bridge.tick(t0 + Duration::from_secs(60)).is_empty());
        assert!(bridge.start(t0).is_empty());
    }
}
