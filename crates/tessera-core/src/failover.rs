//! Client-side failover transport.
//!
//! `FailoverTransport` owns an ordered list of candidate broker URIs and
//! keeps exactly one logical connection alive across them. It is a pure
//! state machine: the driver (`tessera-client`) performs the connects,
//! writes and sleeps it asks for through [`FailoverAction`]s.
//!
//! # State Machine
//!
//! ```text
//!                 start / backoff elapsed
//! ┌──────────────┐───────────────────────>┌────────────┐
//! │ Disconnected │                        │ Connecting │<──────────┐
//! └──────────────┘<───────────────────────└────────────┘           │
//!        ↑          round exhausted           │ socket up          │
//!        │                                    ↓                    │
//!        │                             ┌─────────────┐  fail/timeout│
//!        │                             │ Negotiating │─────────────┤
//!        │                             └─────────────┘             │
//!        │                                    │ negotiated         │
//!        │                                    ↓                    │
//!        │                             ┌───────────┐ lost/migrate  │
//!        │                             │ Connected │───────────────┘
//!        │                             └───────────┘
//!   any phase ──close──> Closed (terminal)
//! ```
//!
//! # Candidate selection
//!
//! Candidates are tried in list order, skipping every endpoint already
//! tried in the current round. The endpoint of a connection that was just
//! lost counts as tried, so the next attempt goes elsewhere. Once the round
//! is exhausted the transport waits for the backoff delay and starts a new
//! round from the head of the list. A successful negotiation resets both
//! the round and the backoff.
//!
//! # Buffering
//!
//! Frames sent while not connected are buffered and replayed in issue order
//! right after the next successful negotiation, before anything sent later.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    time::{Duration, Instant},
};

use tessera_proto::{Frame, Opcode, Payload, payloads::control::ConnectionControl};
use tracing::{debug, info, warn};

use crate::{
    backoff::{BackoffPolicy, ExponentialBackoff},
    connection::{Connection, ConnectionAction, ConnectionConfig, ConnectionPhase},
    error::TransportError,
    uri::{BrokerUri, FailoverUri, UriError},
    wire_format::{URI_OPTION_PREFIX, WireFormatCapabilities},
};

/// Failover tuning, usually parsed from the options of a `failover:` URI.
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverConfig {
    /// Delay between candidate rounds
    pub backoff: BackoffPolicy,
    /// Shuffle the candidate list once at start
    pub randomize: bool,
    /// Accept broker lists pushed by the connected broker
    pub update_uris_supported: bool,
    /// Honour migrate directives from the connected broker
    pub rebalance_enabled: bool,
    /// Bound on a single socket connect
    pub connect_timeout: Duration,
    /// Per-connection settings (wire format, negotiation window)
    pub connection: ConnectionConfig,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(30_000)),
            randomize: true,
            update_uris_supported: true,
            rebalance_enabled: true,
            connect_timeout: Duration::from_millis(5000),
            connection: ConnectionConfig::default(),
        }
    }
}

impl FailoverConfig {
    /// Build from `failover:` URI options on top of the defaults.
    ///
    /// `wireFormat.*` options set the preferred wire format for every
    /// candidate.
    ///
    /// # Errors
    ///
    /// Returns [`UriError::UnknownOption`] for an unrecognised key and
    /// [`UriError::InvalidOption`] for a value that does not parse.
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self, UriError> {
        let mut config = Self::default();
        let mut wire_options = BTreeMap::new();

        for (key, value) in options {
            match key.as_str() {
                "initialReconnectDelay" => {
                    config.backoff.initial = Duration::from_millis(parse_option(key, value)?);
                },
                "maxReconnectDelay" => {
                    config.backoff.max = Duration::from_millis(parse_option(key, value)?);
                },
                "useExponentialBackOff" => config.backoff.exponential = parse_option(key, value)?,
                "backOffMultiplier" => config.backoff.multiplier = parse_option(key, value)?,
                "randomize" => config.randomize = parse_option(key, value)?,
                "updateURIsSupported" => config.update_uris_supported = parse_option(key, value)?,
                "rebalanceEnabled" => config.rebalance_enabled = parse_option(key, value)?,
                "connectTimeout" => {
                    config.connect_timeout = Duration::from_millis(parse_option(key, value)?);
                },
                other if other.starts_with(URI_OPTION_PREFIX) => {
                    wire_options.insert(key.clone(), value.clone());
                },
                _ => return Err(UriError::UnknownOption(key.clone())),
            }
        }

        config.connection.wire_format = config.connection.wire_format.apply_options(&wire_options)?;
        Ok(config)
    }
}

fn parse_option<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, UriError> {
    value
        .parse()
        .map_err(|_| UriError::InvalidOption { key: key.to_string(), value: value.to_string() })
}

/// Lifecycle phase of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailoverPhase {
    /// No socket; either not started or waiting out a backoff
    Disconnected,
    /// Socket connect in flight
    Connecting,
    /// Socket open, wire-format negotiation in flight
    Negotiating,
    /// Negotiated; traffic flows
    Connected,
    /// Closed by the owner (terminal)
    Closed,
}

/// Transitions visible to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// First successful connection
    Connected {
        /// Broker connected to
        uri: BrokerUri,
    },
    /// An established connection was lost; reconnecting
    Interrupted {
        /// Why it was lost
        reason: String,
    },
    /// Connected again after an interruption or a migration
    Resumed {
        /// Broker connected to
        uri: BrokerUri,
    },
    /// Every candidate failed this round; retrying after a delay
    Exhausted {
        /// Candidates tried in the round
        attempts: usize,
        /// Delay before the next round
        retry_in: Duration,
    },
    /// Closed by the owner
    Closed {
        /// Buffered frames that were never sent
        undelivered: usize,
    },
}

/// Actions for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverAction {
    /// Open a socket to `uri`. Report the result with `attempt`.
    Connect {
        /// Target broker
        uri: BrokerUri,
        /// Attempt identifier
        attempt: u64,
    },
    /// Write this frame to the current socket
    Send(Frame),
    /// Drop the socket (or cancel the connect) of `attempt`
    Disconnect {
        /// Attempt identifier
        attempt: u64,
    },
    /// Inbound application frame for the layer above
    Deliver(Frame),
    /// Application-visible transition
    Notify(TransportEvent),
}

#[derive(Debug, Clone)]
struct Attempt {
    id: u64,
    uri: BrokerUri,
    started: Instant,
    connection: Option<Connection>,
}

/// Failover state machine
#[derive(Debug, Clone)]
pub struct FailoverTransport {
    config: FailoverConfig,
    configured: Vec<BrokerUri>,
    candidates: Vec<BrokerUri>,
    tried: BTreeSet<String>,
    phase: FailoverPhase,
    current: Option<Attempt>,
    next_attempt: u64,
    backoff: ExponentialBackoff,
    retry_at: Option<Instant>,
    buffer: VecDeque<Frame>,
    ever_connected: bool,
}

impl FailoverTransport {
    /// Create a transport over `candidates`, in
    /// [`FailoverPhase::Disconnected`].
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` for an empty list or a candidate
    /// with invalid `wireFormat.*` options.
    pub fn new(candidates: Vec<BrokerUri>, config: FailoverConfig) -> Result<Self, TransportError> {
        if candidates.is_empty() {
            return Err(TransportError::Config("failover transport needs at least one URI".into()));
        }
        for uri in &candidates {
            config.connection.wire_format.apply_options(uri.options())?;
        }

        let candidates = dedup(candidates);
        Ok(Self {
            backoff: ExponentialBackoff::new(config.backoff),
            config,
            configured: candidates.clone(),
            candidates,
            tried: BTreeSet::new(),
            phase: FailoverPhase::Disconnected,
            current: None,
            next_attempt: 1,
            retry_at: None,
            buffer: VecDeque::new(),
            ever_connected: false,
        })
    }

    /// Create a transport from a parsed `failover:` URI.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` for invalid options.
    pub fn from_uri(uri: &FailoverUri) -> Result<Self, TransportError> {
        let config = FailoverConfig::from_options(&uri.options)?;
        Self::new(uri.uris.clone(), config)
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> FailoverPhase {
        self.phase
    }

    /// Candidate list in preference order
    #[must_use]
    pub fn candidates(&self) -> &[BrokerUri] {
        &self.candidates
    }

    /// Broker of the current attempt or connection
    #[must_use]
    pub fn current_uri(&self) -> Option<&BrokerUri> {
        self.current.as_ref().map(|attempt| &attempt.uri)
    }

    /// Identifier of the current attempt
    #[must_use]
    pub fn current_attempt(&self) -> Option<u64> {
        self.current.as_ref().map(|attempt| attempt.id)
    }

    /// Negotiated capabilities of the live connection
    #[must_use]
    pub fn negotiated(&self) -> Option<&WireFormatCapabilities> {
        self.current.as_ref()?.connection.as_ref()?.negotiated()
    }

    /// Frames waiting for a connection
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Configuration in force
    #[must_use]
    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Begin connecting.
    ///
    /// With `randomize` the candidate list is shuffled once using
    /// `next_random`.
    pub fn start(&mut self, now: Instant, next_random: impl FnMut() -> u64) -> Vec<FailoverAction> {
        if self.phase != FailoverPhase::Disconnected || self.ever_connected || self.current.is_some()
        {
            return vec![];
        }
        if self.config.randomize {
            shuffle(&mut self.candidates, next_random);
        }
        self.connect_next(now)
    }

    /// The socket for `attempt` is open.
    pub fn on_connected(&mut self, attempt: u64, now: Instant) -> Vec<FailoverAction> {
        if self.phase != FailoverPhase::Connecting || self.current_attempt() != Some(attempt) {
            return vec![FailoverAction::Disconnect { attempt }];
        }
        let Some(current) = self.current.as_mut() else {
            return vec![FailoverAction::Disconnect { attempt }];
        };

        let mut config = self.config.connection.clone();
        if let Ok(wire_format) = config.wire_format.apply_options(current.uri.options()) {
            config.wire_format = wire_format;
        }

        let mut connection = Connection::new(now, config);
        let started = connection.start(now);
        current.connection = Some(connection);

        match started {
            Ok(actions) => {
                self.phase = FailoverPhase::Negotiating;
                debug!(uri = %current.uri, attempt, "negotiating");
                self.absorb(actions, now)
            },
            Err(err) => self.connection_failed(err, now),
        }
    }

    /// The socket connect for `attempt` failed.
    pub fn on_connect_failed(
        &mut self,
        attempt: u64,
        error: &TransportError,
        now: Instant,
    ) -> Vec<FailoverAction> {
        if self.phase != FailoverPhase::Connecting || self.current_attempt() != Some(attempt) {
            return vec![];
        }
        if let Some(current) = self.current.take() {
            warn!(uri = %current.uri, attempt, %error, "connect failed");
        }
        self.connect_next(now)
    }

    /// The socket of `attempt` failed or was closed by the peer.
    pub fn on_socket_error(
        &mut self,
        attempt: u64,
        error: TransportError,
        now: Instant,
    ) -> Vec<FailoverAction> {
        if self.current_attempt() != Some(attempt)
            || !matches!(self.phase, FailoverPhase::Negotiating | FailoverPhase::Connected)
        {
            return vec![];
        }
        self.connection_failed(error, now)
    }

    /// Process a frame read from the socket of `attempt`.
    pub fn handle_frame(&mut self, attempt: u64, frame: &Frame, now: Instant) -> Vec<FailoverAction> {
        if self.current_attempt() != Some(attempt) {
            return vec![];
        }
        let Some(connection) = self.current.as_mut().and_then(|a| a.connection.as_mut()) else {
            return vec![];
        };

        match connection.handle_frame(frame, now) {
            Ok(actions) => self.absorb(actions, now),
            Err(err) => self.connection_failed(err, now),
        }
    }

    /// Queue an outbound frame.
    ///
    /// Sent immediately when connected, buffered otherwise.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` after [`close`](Self::close).
    pub fn send(&mut self, frame: Frame, now: Instant) -> Result<Vec<FailoverAction>, TransportError> {
        match self.phase {
            FailoverPhase::Closed => Err(TransportError::Closed),
            FailoverPhase::Connected if self.buffer.is_empty() => {
                let Some(connection) = self.current.as_mut().and_then(|a| a.connection.as_mut())
                else {
                    self.buffer.push_back(frame);
                    return Ok(vec![]);
                };
                let frame = connection.send(frame, now)?;
                Ok(vec![FailoverAction::Send(frame)])
            },
            _ => {
                self.buffer.push_back(frame);
                Ok(vec![])
            },
        }
    }

    /// Drive timers: backoff expiry, connect timeout, negotiation window
    /// and inactivity monitoring.
    pub fn tick(&mut self, now: Instant) -> Vec<FailoverAction> {
        match self.phase {
            FailoverPhase::Disconnected => match self.retry_at {
                Some(at) if now >= at => {
                    self.retry_at = None;
                    self.connect_next(now)
                },
                _ => vec![],
            },
            FailoverPhase::Connecting => {
                let Some(current) = self.current.as_ref() else {
                    return self.connect_next(now);
                };
                if now.saturating_duration_since(current.started) < self.config.connect_timeout {
                    return vec![];
                }
                let attempt = current.id;
                let error = TransportError::Socket(format!(
                    "connect to {} timed out after {:?}",
                    current.uri, self.config.connect_timeout
                ));
                let mut actions = vec![FailoverAction::Disconnect { attempt }];
                actions.extend(self.on_connect_failed(attempt, &error, now));
                actions
            },
            FailoverPhase::Negotiating | FailoverPhase::Connected => {
                let Some(connection) = self.current.as_mut().and_then(|a| a.connection.as_mut())
                else {
                    return vec![];
                };
                let actions = connection.tick(now);
                self.absorb(actions, now)
            },
            FailoverPhase::Closed => vec![],
        }
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    #[must_use]
    pub fn next_wakeup(&self) -> Option<Instant> {
        match self.phase {
            FailoverPhase::Disconnected => self.retry_at,
            FailoverPhase::Connecting => {
                self.current.as_ref().map(|a| a.started + self.config.connect_timeout)
            },
            FailoverPhase::Negotiating | FailoverPhase::Connected => {
                self.current.as_ref()?.connection.as_ref()?.next_wakeup()
            },
            FailoverPhase::Closed => None,
        }
    }

    /// Merge a broker-pushed candidate list, migrating if directed.
    ///
    /// The merged list is the pushed list in order, followed by the
    /// originally configured URIs not already present. The live connection
    /// is kept unless the update carries a migrate directive for a
    /// different broker.
    pub fn apply_update(&mut self, control: &ConnectionControl, now: Instant) -> Vec<FailoverAction> {
        if self.phase == FailoverPhase::Closed {
            return vec![];
        }
        if !self.config.update_uris_supported {
            debug!("ignoring pushed broker list");
            return vec![];
        }

        let mut pushed = Vec::with_capacity(control.connected_brokers.len());
        for raw in &control.connected_brokers {
            match BrokerUri::parse(raw) {
                Ok(uri) if self.config.connection.wire_format.apply_options(uri.options()).is_ok() => {
                    pushed.push(uri);
                },
                Ok(_) => warn!(uri = %raw, "ignoring pushed URI with invalid options"),
                Err(err) => warn!(uri = %raw, %err, "ignoring unparseable pushed URI"),
            }
        }

        let mut merged = pushed.clone();
        merged.extend(self.configured.iter().cloned());
        self.candidates = dedup(merged);
        debug!(candidates = self.candidates.len(), "candidate list updated");

        if !control.rebalance || !self.config.rebalance_enabled {
            return vec![];
        }

        let target = match control.reconnect_to.as_deref() {
            Some(raw) => match BrokerUri::parse(raw) {
                Ok(uri) => Some(uri),
                Err(err) => {
                    warn!(uri = %raw, %err, "ignoring unparseable migration target");
                    None
                },
            },
            None => pushed.first().cloned(),
        };
        let Some(target) = target else {
            return vec![];
        };
        if self.current_uri().is_some_and(|uri| uri.same_endpoint(&target)) {
            return vec![];
        }

        self.migrate(target, now)
    }

    /// Close the transport for good.
    ///
    /// Cancels any pending backoff or connect; buffered frames are
    /// discarded and counted in [`TransportEvent::Closed`].
    pub fn close(&mut self, now: Instant) -> Vec<FailoverAction> {
        if self.phase == FailoverPhase::Closed {
            return vec![];
        }

        let mut actions = Vec::new();
        if let Some(mut current) = self.current.take() {
            if let Some(connection) = current.connection.as_mut() {
                for action in connection.close("client shutdown", now) {
                    if let ConnectionAction::SendFrame(frame) = action {
                        actions.push(FailoverAction::Send(frame));
                    }
                }
            }
            actions.push(FailoverAction::Disconnect { attempt: current.id });
        }

        let undelivered = self.buffer.len();
        self.buffer.clear();
        self.retry_at = None;
        self.phase = FailoverPhase::Closed;
        info!(undelivered, "failover transport closed");

        actions.push(FailoverAction::Notify(TransportEvent::Closed { undelivered }));
        actions
    }

    fn migrate(&mut self, target: BrokerUri, now: Instant) -> Vec<FailoverAction> {
        info!(from = ?self.current_uri().map(ToString::to_string), to = %target, "migrating");

        let mut actions = Vec::new();
        if let Some(mut current) = self.current.take() {
            if let Some(connection) = current.connection.as_mut() {
                for action in connection.close("rebalance", now) {
                    if let ConnectionAction::SendFrame(frame) = action {
                        actions.push(FailoverAction::Send(frame));
                    }
                }
            }
            actions.push(FailoverAction::Disconnect { attempt: current.id });
        }

        self.tried.clear();
        self.retry_at = None;
        actions.extend(self.connect_to(target, now));
        actions
    }

    fn absorb(&mut self, actions: Vec<ConnectionAction>, now: Instant) -> Vec<FailoverAction> {
        let mut out = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                ConnectionAction::SendFrame(frame) => out.push(FailoverAction::Send(frame)),
                ConnectionAction::Established(_) => out.extend(self.established(now)),
                ConnectionAction::Deliver(frame) => {
                    if frame.header.opcode_enum() == Some(Opcode::ConnectionControl) {
                        match Payload::from_frame(&frame) {
                            Ok(Payload::ConnectionControl(control)) => {
                                out.extend(self.apply_update(&control, now));
                            },
                            _ => warn!("dropping malformed connection control frame"),
                        }
                    } else {
                        out.push(FailoverAction::Deliver(frame));
                    }
                },
                ConnectionAction::Close { error } => {
                    let error = error.unwrap_or(TransportError::Closed);
                    out.extend(self.connection_failed(error, now));
                    break;
                },
            }
        }
        out
    }

    fn established(&mut self, now: Instant) -> Vec<FailoverAction> {
        let Some(current) = self.current.as_mut() else {
            return vec![];
        };
        self.phase = FailoverPhase::Connected;
        self.backoff.reset();
        self.tried.clear();

        let uri = current.uri.clone();
        let event = if self.ever_connected {
            TransportEvent::Resumed { uri: uri.clone() }
        } else {
            TransportEvent::Connected { uri: uri.clone() }
        };
        self.ever_connected = true;
        info!(%uri, replay = self.buffer.len(), "connected");

        let mut actions = vec![FailoverAction::Notify(event)];
        if let Some(connection) = current.connection.as_mut() {
            while let Some(frame) = self.buffer.pop_front() {
                match connection.send(frame, now) {
                    Ok(frame) => actions.push(FailoverAction::Send(frame)),
                    Err(err) => {
                        warn!(%err, "replay interrupted");
                        break;
                    },
                }
            }
        }
        actions
    }

    fn connection_failed(&mut self, error: TransportError, now: Instant) -> Vec<FailoverAction> {
        let was_connected = self.phase == FailoverPhase::Connected;
        let mut actions = Vec::new();

        if let Some(mut current) = self.current.take() {
            if let Some(connection) = current.connection.as_mut() {
                connection.fail();
            }
            warn!(uri = %current.uri, attempt = current.id, %error, "connection failed");
            self.tried.insert(current.uri.endpoint());
            actions.push(FailoverAction::Disconnect { attempt: current.id });
        }

        if was_connected {
            actions.push(FailoverAction::Notify(TransportEvent::Interrupted {
                reason: error.to_string(),
            }));
        }

        actions.extend(self.connect_next(now));
        actions
    }

    fn connect_next(&mut self, now: Instant) -> Vec<FailoverAction> {
        let next = self.candidates.iter().find(|uri| !self.tried.contains(&uri.endpoint())).cloned();

        if let Some(uri) = next {
            return self.connect_to(uri, now);
        }

        let attempts = self.tried.len().max(self.candidates.len());
        let retry_in = self.backoff.next_delay();
        self.tried.clear();
        self.current = None;
        self.phase = FailoverPhase::Disconnected;
        self.retry_at = Some(now + retry_in);

        let error = TransportError::ExhaustedCandidates { candidates: attempts, retry_in };
        warn!(%error, "candidate round exhausted");

        vec![FailoverAction::Notify(TransportEvent::Exhausted { attempts, retry_in })]
    }

    fn connect_to(&mut self, uri: BrokerUri, now: Instant) -> Vec<FailoverAction> {
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        self.tried.insert(uri.endpoint());
        self.phase = FailoverPhase::Connecting;
        self.current = Some(Attempt { id: attempt, uri: uri.clone(), started: now, connection: None });
        debug!(%uri, attempt, "connecting");

        vec![FailoverAction::Connect { uri, attempt }]
    }
}

impl FailoverTransport {
    /// Phase of the live physical connection, if any.
    #[must_use]
    pub fn connection_phase(&self) -> Option<ConnectionPhase> {
        Some(self.current.as_ref()?.connection.as_ref()?.phase())
    }
}

fn dedup(uris: Vec<BrokerUri>) -> Vec<BrokerUri> {
    let mut seen = BTreeSet::new();
    uris.into_iter().filter(|uri| seen.insert(uri.endpoint())).collect()
}

/// Fisher-Yates shuffle driven by an external random source.
pub fn shuffle<T>(items: &mut [T], mut next_random: impl FnMut() -> u64) {
    for i in (1..items.len()).rev() {
        #[allow(clippy::cast_possible_truncation)]
        let j = (next_random() % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use tessera_proto::payloads::message::Message;

    use super::*;

    fn uri(s: &str) -> BrokerUri {
        BrokerUri::parse(s).expect("uri")
    }

    fn ordered_config() -> FailoverConfig {
        FailoverConfig { randomize: false, ..FailoverConfig::default() }
    }

    fn transport(uris: &[&str]) -> FailoverTransport {
        FailoverTransport::new(uris.iter().map(|s| uri(s)).collect(), ordered_config())
            .expect("transport")
    }

    fn no_random() -> u64 {
        0
    }

    fn peer_negotiation() -> Frame {
        Payload::WireFormatInfo(WireFormatCapabilities::default().to_info()).to_frame().expect("encode")
    }

    fn message(id: &str) -> Frame {
        Payload::Message(Message::new(id, "orders", vec![])).to_frame().expect("encode")
    }

    fn connect_target(actions: &[FailoverAction]) -> Option<(BrokerUri, u64)> {
        actions.iter().find_map(|action| match action {
            FailoverAction::Connect { uri, attempt } => Some((uri.clone(), *attempt)),
            _ => None,
        })
    }

    fn events(actions: &[FailoverAction]) -> Vec<TransportEvent> {
        actions
            .iter()
            .filter_map(|action| match action {
                FailoverAction::Notify(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn sent_ids(actions: &[FailoverAction]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|action| match action {
                FailoverAction::Send(frame) => match Payload::from_frame(frame) {
                    Ok(Payload::Message(m)) => Some(m.message_id),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    /// Connect and negotiate the pending attempt, returning the actions of
    /// the negotiation step.
    fn establish(t: &mut FailoverTransport, attempt: u64, now: Instant) -> Vec<FailoverAction> {
        let actions = t.on_connected(attempt, now);
        assert!(matches!(actions.as_slice(), [FailoverAction::Send(_)]));
        t.handle_frame(attempt, &peer_negotiation(), now)
    }

    #[test]
    fn empty_candidate_list_is_rejected() {
        let err = FailoverTransport::new(vec![], FailoverConfig::default()).err().expect("error");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn duplicate_endpoints_are_collapsed() {
        let t = transport(&["tcp://a:1", "tcp://a:1?wireFormat.cacheEnabled=false", "tcp://b:2"]);
        assert_eq!(t.candidates().len(), 2);
    }

    #[test]
    fn options_are_parsed_and_unknown_ones_rejected() {
        let parsed = FailoverUri::parse(
            "failover:(tcp://a:1)?initialReconnectDelay=100&maxReconnectDelay=1000&randomize=false&wireFormat.maxInactivityDuration=0",
        )
        .expect("uri");
        let config = FailoverConfig::from_options(&parsed.options).expect("options");
        assert_eq!(config.backoff.initial, Duration::from_millis(100));
        assert_eq!(config.backoff.max, Duration::from_secs(1));
        assert!(!config.randomize);
        assert_eq!(config.connection.wire_format.max_inactivity, Duration::ZERO);

        let parsed = FailoverUri::parse("failover:(tcp://a:1)?bogus=1").expect("uri");
        assert_eq!(
            FailoverConfig::from_options(&parsed.options),
            Err(UriError::UnknownOption("bogus".into()))
        );
    }

    #[test]
    fn connects_to_first_candidate_and_reports_connected() {
        let t0 = Instant::now();
        let mut t = transport(&["tcp://a:1", "tcp://b:2"]);

        let actions = t.start(t0, no_random);
        let (target, attempt) = connect_target(&actions).expect("connect");
        assert_eq!(target, uri("tcp://a:1"));
        assert_eq!(t.phase(), FailoverPhase::Connecting);

        let actions = establish(&mut t, attempt, t0);
        assert_eq!(events(&actions), vec![TransportEvent::Connected { uri: uri("tcp://a:1") }]);
        assert_eq!(t.phase(), FailoverPhase::Connected);
        assert!(t.negotiated().is_some());
    }

    #[test]
    fn connect_failure_moves_to_next_candidate() {
        let t0 = Instant::now();
        let mut t = transport(&["tcp://a:1", "tcp://b:2"]);
        let (_, attempt) = connect_target(&t.start(t0, no_random)).expect("connect");

        let actions = t.on_connect_failed(attempt, &TransportError::Socket("refused".into()), t0);
        let (target, _) = connect_target(&actions).expect("connect");
        assert_eq!(target, uri("tcp://b:2"));
    }

    #[test]
    fn exhausted_round_backs_off_then_restarts_from_head() {
        let t0 = Instant::now();
        let mut t = transport(&["tcp://a:1", "tcp://b:2"]);
        let refused = TransportError::Socket("refused".into());

        let (_, first) = connect_target(&t.start(t0, no_random)).expect("connect");
        let (_, second) = connect_target(&t.on_connect_failed(first, &refused, t0)).expect("connect");
        let actions = t.on_connect_failed(second, &refused, t0);

        assert_eq!(events(&actions), vec![TransportEvent::Exhausted {
            attempts: 2,
            retry_in: Duration::from_millis(10)
        }]);
        assert_eq!(t.phase(), FailoverPhase::Disconnected);
        assert_eq!(t.next_wakeup(), Some(t0 + Duration::from_millis(10)));
        assert!(t.tick(t0 + Duration::from_millis(5)).is_empty());

        let actions = t.tick(t0 + Duration::from_millis(10));
        let (target, third) = connect_target(&actions).expect("connect");
        assert_eq!(target, uri("tcp://a:1"));

        let fourth = connect_target(&t.on_connect_failed(third, &refused, t0)).expect("connect").1;
        let actions = t.on_connect_failed(fourth, &refused, t0);
        assert_eq!(events(&actions), vec![TransportEvent::Exhausted {
            attempts: 2,
            retry_in: Duration::from_millis(20)
        }]);
    }

    #[test]
    fn lost_connection_reconnects_elsewhere_first() {
        let t0 = Instant::now();
        let mut t = transport(&["tcp://a:1", "tcp://b:2", "tcp://c:3"]);
        let (_, attempt) = connect_target(&t.start(t0, no_random)).expect("connect");
        establish(&mut t, attempt, t0);

        let actions = t.on_socket_error(attempt, TransportError::Socket("reset".into()), t0);
        assert!(actions.contains(&FailoverAction::Disconnect { attempt }));
        assert!(matches!(events(&actions).as_slice(), [TransportEvent::Interrupted { .. }]));

        let (target, next) = connect_target(&actions).expect("reconnect");
        assert_ne!(target, uri("tcp://a:1"));

        let actions = establish(&mut t, next, t0);
        assert_eq!(events(&actions), vec![TransportEvent::Resumed { uri: target }]);
    }

    #[test]
    fn buffered_frames_replay_in_issue_order() {
        let t0 = Instant::now();
        let mut t = transport(&["tcp://a:1"]);
        let (_, attempt) = connect_target(&t.start(t0, no_random)).expect("connect");

        for id in ["m1", "m2", "m3"] {
            assert!(t.send(message(id), t0).expect("send").is_empty());
        }
        assert_eq!(t.buffered(), 3);

        let actions = establish(&mut t, attempt, t0);
        assert_eq!(sent_ids(&actions), vec!["m1", "m2", "m3"]);
        assert_eq!(t.buffered(), 0);

        let actions = t.send(message("m4"), t0).expect("send");
        assert_eq!(sent_ids(&actions), vec!["m4"]);
    }

    #[test]
    fn negotiation_failure_tries_next_candidate() {
        let t0 = Instant::now();
        let mut t = transport(&["tcp://a:1", "tcp://b:2"]);
        let (_, attempt) = connect_target(&t.start(t0, no_random)).expect("connect");
        t.on_connected(attempt, t0);

        let actions = t.handle_frame(attempt, &message("early"), t0);
        assert!(events(&actions).is_empty());
        let (target, _) = connect_target(&actions).expect("connect");
        assert_eq!(target, uri("tcp://b:2"));
    }

    #[test]
    fn connect_timeout_abandons_attempt() {
        let t0 = Instant::now();
        let mut t = transport(&["tcp://a:1", "tcp://b:2"]);
        let (_, attempt) = connect_target(&t.start(t0, no_random)).expect("connect");

        assert_eq!(t.next_wakeup(), Some(t0 + Duration::from_secs(5)));
        let actions = t.tick(t0 + Duration::from_secs(5));
        assert_eq!(actions[0], FailoverAction::Disconnect { attempt });
        assert_eq!(connect_target(&actions).expect("connect").0, uri("tcp://b:2"));
    }

    #[test]
    fn stale_attempt_results_are_ignored() {
        let t0 = Instant::now();
        let mut t = transport(&["tcp://a:1", "tcp://b:2"]);
        let (_, first) = connect_target(&t.start(t0, no_random)).expect("connect");
        let refused = TransportError::Socket("refused".into());
        let (_, second) = connect_target(&t.on_connect_failed(first, &refused, t0)).expect("connect");

        assert_eq!(t.on_connected(first, t0), vec![FailoverAction::Disconnect { attempt: first }]);
        assert!(t.on_connect_failed(first, &refused, t0).is_empty());
        assert!(t.handle_frame(first, &peer_negotiation(), t0).is_empty());
        assert_eq!(t.current_attempt(), Some(second));
    }

    #[test]
    fn pushed_list_merges_without_disconnecting() {
        let t0 = Instant::now();
        let mut t = transport(&["tcp://a:1", "tcp://b:2"]);
        let (_, attempt) = connect_target(&t.start(t0, no_random)).expect("connect");
        establish(&mut t, attempt, t0);

        let control = ConnectionControl {
            connected_brokers: vec!["tcp://c:3".into(), "tcp://a:1".into(), "bogus".into()],
            rebalance: false,
            reconnect_to: None,
        };
        let frame = Payload::ConnectionControl(control).to_frame().expect("encode");
        let actions = t.handle_frame(attempt, &frame, t0);

        assert!(actions.is_empty());
        assert_eq!(t.candidates(), &[uri("tcp://c:3"), uri("tcp://a:1"), uri("tcp://b:2")]);
        assert_eq!(t.phase(), FailoverPhase::Connected);
    }

    #[test]
    fn migrate_directive_moves_connection_without_interruption() {
        let t0 = Instant::now();
        let mut t = transport(&["tcp://a:1"]);
        let (_, attempt) = connect_target(&t.start(t0, no_random)).expect("connect");
        establish(&mut t, attempt, t0);

        let control = ConnectionControl {
            connected_brokers: vec!["tcp://a:1".into(), "tcp://b:2".into()],
            rebalance: true,
            reconnect_to: Some("tcp://b:2".into()),
        };
        let actions = t.apply_update(&control, t0);

        assert!(actions.contains(&FailoverAction::Disconnect { attempt }));
        assert!(events(&actions).is_empty());
        let (target, next) = connect_target(&actions).expect("migrate");
        assert_eq!(target, uri("tcp://b:2"));

        t.send(message("during-migration"), t0).expect("send");
        let actions = establish(&mut t, next, t0);
        assert_eq!(events(&actions), vec![TransportEvent::Resumed { uri: uri("tcp://b:2") }]);
        assert_eq!(sent_ids(&actions), vec!["during-migration"]);
    }

    #[test]
    fn migrate_directive_to_current_broker_is_a_no_op() {
        let t0 = Instant::now();
        let mut t = transport(&["tcp://a:1"]);
        let (_, attempt) = connect_target(&t.start(t0, no_random)).expect("connect");
        establish(&mut t, attempt, t0);

        let control = ConnectionControl {
            connected_brokers: vec!["tcp://a:1".into(), "tcp://b:2".into()],
            rebalance: true,
            reconnect_to: None,
        };
        assert!(t.apply_update(&control, t0).is_empty());
        assert_eq!(t.phase(), FailoverPhase::Connected);
    }

    #[test]
    fn rebalance_disabled_ignores_directive() {
        let t0 = Instant::now();
        let config = FailoverConfig { rebalance_enabled: false, ..ordered_config() };
        let mut t = FailoverTransport::new(vec![uri("tcp://a:1")], config).expect("transport");
        let (_, attempt) = connect_target(&t.start(t0, no_random)).expect("connect");
        establish(&mut t, attempt, t0);

        let control = ConnectionControl {
            connected_brokers: vec!["tcp://b:2".into()],
            rebalance: true,
            reconnect_to: None,
        };
        assert!(t.apply_update(&control, t0).is_empty());
        assert_eq!(t.candidates().len(), 2);
    }

    #[test]
    fn updates_unsupported_keeps_configured_list() {
        let t0 = Instant::now();
        let config = FailoverConfig { update_uris_supported: false, ..ordered_config() };
        let mut t = FailoverTransport::new(vec![uri("tcp://a:1")], config).expect("transport");

        let control = ConnectionControl {
            connected_brokers: vec!["tcp://b:2".into()],
            rebalance: true,
            reconnect_to: None,
        };
        assert!(t.apply_update(&control, t0).is_empty());
        assert_eq!(t.candidates(), &[uri("tcp://a:1")]);
    }

    #[test]
    fn close_during_backoff_stops_everything() {
        let t0 = Instant::now();
        let mut t = transport(&["tcp://a:1"]);
        let (_, attempt) = connect_target(&t.start(t0, no_random)).expect("connect");
        t.on_connect_failed(attempt, &TransportError::Socket("refused".into()), t0);
        t.send(message("m1"), t0).expect("send");
        assert!(t.next_wakeup().is_some());

        let actions = t.close(t0);
        assert_eq!(events(&actions), vec![TransportEvent::Closed { undelivered: 1 }]);
        assert_eq!(t.phase(), FailoverPhase::Closed);
        assert_eq!(t.next_wakeup(), None);
        assert!(t.tick(t0 + Duration::from_secs(60)).is_empty());
        assert_eq!(t.send(message("m2"), t0), Err(TransportError::Closed));
        assert!(t.close(t0).is_empty());
    }

    #[test]
    fn close_while_connecting_cancels_attempt() {
        let t0 = Instant::now();
        let mut t = transport(&["tcp://a:1"]);
        let (_, attempt) = connect_target(&t.start(t0, no_random)).expect("connect");

        let actions = t.close(t0);
        assert_eq!(actions[0], FailoverAction::Disconnect { attempt });
        assert!(t.on_connected(attempt, t0).contains(&FailoverAction::Disconnect { attempt }));
        assert_eq!(t.phase(), FailoverPhase::Closed);
    }

    #[test]
    fn randomize_shuffles_once_with_supplied_randomness() {
        let t0 = Instant::now();
        let config = FailoverConfig { randomize: true, ..FailoverConfig::default() };
        let uris = vec![uri("tcp://a:1"), uri("tcp://b:2"), uri("tcp://c:3")];
        let mut t = FailoverTransport::new(uris.clone(), config).expect("transport");

        let mut expected = uris;
        shuffle(&mut expected, || 1);
        t.start(t0, || 1);
        assert_eq!(t.candidates(), expected.as_slice());
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut items: Vec<u32> = (0..10).collect();
        let mut state = 7u64;
        shuffle(&mut items, || {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            state >> 33
        });
        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }
}
