//! Per-socket connection state machine.
//!
//! Owns the negotiated [`WireFormatCapabilities`] and the
//! [`InactivityMonitor`] of one physical connection. Both the client side
//! (inside [`FailoverTransport`](crate::failover::FailoverTransport)) and the
//! broker side (inside the connector and bridge drivers) run the same
//! machine: negotiation is symmetric, so there is no initiator/responder
//! split here.
//!
//! # Architecture: Action-Based State Machine
//!
//! - Methods accept time as parameter (no stored Environment)
//! - Methods return actions; the driver performs the I/O
//! - Errors that end the connection are returned as `Err` from
//!   [`Connection::handle_frame`] or as [`ConnectionAction::Close`] from
//!   [`Connection::tick`]
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ start ┌─────────────┐ WireFormatInfo ┌───────────┐
//! │ Init │──────>│ Negotiating │───────────────>│ Connected │
//! └──────┘       └─────────────┘                └───────────┘
//!                   │ timeout/mismatch               │ inactive/error
//!                   ↓                                ↓
//!               ┌────────┐                       ┌────────┐
//!               │ Failed │                       │ Failed │
//!               └────────┘                       └────────┘
//! ```
//!
//! Any phase moves to `Closed` on [`Connection::close`].

use std::time::{Duration, Instant};

use tessera_proto::{
    Frame, FrameHeader, Opcode, Payload, payloads::control::ShutdownInfo,
};
use tracing::debug;

use crate::{
    error::TransportError,
    inactivity::{InactivityMonitor, MonitorEvent},
    wire_format::{WireFormatCapabilities, negotiate},
};

/// Default bound on the negotiation window.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Lifecycle phase of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    /// Created, negotiation frame not yet sent
    Init,
    /// Negotiation frame sent, waiting for the peer's
    Negotiating,
    /// Negotiated; application traffic may flow
    Connected,
    /// Ended by an error (timeout, mismatch, inactivity)
    Failed,
    /// Ended by the owner
    Closed,
}

impl ConnectionPhase {
    /// True for `Failed` and `Closed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Actions returned by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Write this frame to the socket
    SendFrame(Frame),
    /// Negotiation finished; the capabilities are fixed from here on
    Established(WireFormatCapabilities),
    /// Hand this inbound frame to the layer above
    Deliver(Frame),
    /// Close the socket. `error` is `None` for an orderly local close.
    Close {
        /// Why the connection ended
        error: Option<TransportError>,
    },
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Preferred capabilities sent in the negotiation frame
    pub wire_format: WireFormatCapabilities,
    /// Time allowed for the peer's negotiation frame to arrive
    pub negotiation_timeout: Duration,
    /// Read deadline multiplier, clamped to 1.0..=1.5
    pub inactivity_safety_factor: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            wire_format: WireFormatCapabilities::default(),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            inactivity_safety_factor: 1.0,
        }
    }
}

/// Connection state machine
#[derive(Debug, Clone)]
pub struct Connection {
    phase: ConnectionPhase,
    config: ConnectionConfig,
    created_at: Instant,
    negotiation_started: Option<Instant>,
    negotiated: Option<WireFormatCapabilities>,
    monitor: Option<InactivityMonitor>,
    next_command_id: u32,
}

impl Connection {
    /// Create a connection in [`ConnectionPhase::Init`].
    #[must_use]
    pub fn new(now: Instant, config: ConnectionConfig) -> Self {
        Self {
            phase: ConnectionPhase::Init,
            config,
            created_at: now,
            negotiation_started: None,
            negotiated: None,
            monitor: None,
            next_command_id: 1,
        }
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Negotiated capabilities, once connected.
    #[must_use]
    pub fn negotiated(&self) -> Option<&WireFormatCapabilities> {
        self.negotiated.as_ref()
    }

    /// Configuration in force
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Creation time
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Send our preferred capabilities and start the negotiation window.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless in `Init`, or `Protocol` if the
    /// negotiation frame cannot be encoded.
    pub fn start(&mut self, now: Instant) -> Result<Vec<ConnectionAction>, TransportError> {
        if self.phase != ConnectionPhase::Init {
            return Err(TransportError::InvalidState { phase: self.phase, operation: "start" });
        }

        let frame = Payload::WireFormatInfo(self.config.wire_format.to_info()).to_frame()?;

        self.phase = ConnectionPhase::Negotiating;
        self.negotiation_started = Some(now);

        Ok(vec![ConnectionAction::SendFrame(frame)])
    }

    /// Process a frame received from the peer.
    ///
    /// # Errors
    ///
    /// - `NegotiationMismatch` if the first frame is not a valid negotiation
    ///   frame or advertises an unsupported version
    /// - `UnexpectedFrame` for a second negotiation frame or a frame in a
    ///   phase that accepts none
    ///
    /// The connection is `Failed` after any error; the driver closes the
    /// socket.
    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        now: Instant,
    ) -> Result<Vec<ConnectionAction>, TransportError> {
        match self.phase {
            ConnectionPhase::Negotiating => self.handle_negotiation(frame, now),
            ConnectionPhase::Connected => self.handle_connected(frame, now),
            phase => Err(TransportError::UnexpectedFrame { phase, opcode: frame.header.opcode() }),
        }
    }

    fn handle_negotiation(
        &mut self,
        frame: &Frame,
        now: Instant,
    ) -> Result<Vec<ConnectionAction>, TransportError> {
        let remote = match Payload::from_frame(frame) {
            Ok(Payload::WireFormatInfo(info)) => info,
            Ok(_) => {
                self.phase = ConnectionPhase::Failed;
                return Err(TransportError::NegotiationMismatch(format!(
                    "expected negotiation frame, got opcode {:#06x}",
                    frame.header.opcode()
                )));
            },
            Err(err) => {
                self.phase = ConnectionPhase::Failed;
                return Err(TransportError::NegotiationMismatch(format!(
                    "unparseable negotiation frame: {err}"
                )));
            },
        };

        let negotiated = match negotiate(&self.config.wire_format, &remote) {
            Ok(caps) => caps,
            Err(err) => {
                self.phase = ConnectionPhase::Failed;
                return Err(err);
            },
        };

        debug!(
            version = negotiated.version,
            max_inactivity_ms = negotiated.max_inactivity.as_millis(),
            "wire format negotiated"
        );

        self.phase = ConnectionPhase::Connected;
        self.negotiated = Some(negotiated);
        self.monitor = Some(InactivityMonitor::new(
            negotiated.max_inactivity,
            self.config.inactivity_safety_factor,
            now,
        ));

        Ok(vec![ConnectionAction::Established(negotiated)])
    }

    fn handle_connected(
        &mut self,
        frame: &Frame,
        now: Instant,
    ) -> Result<Vec<ConnectionAction>, TransportError> {
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.record_read(now);
        }

        match frame.header.opcode_enum() {
            Some(Opcode::KeepAlive) => Ok(vec![]),
            Some(Opcode::WireFormatInfo) => {
                self.phase = ConnectionPhase::Failed;
                Err(TransportError::UnexpectedFrame {
                    phase: ConnectionPhase::Connected,
                    opcode: frame.header.opcode(),
                })
            },
            Some(Opcode::Shutdown) => {
                let reason = match Payload::from_frame(frame) {
                    Ok(Payload::Shutdown(info)) => info.reason,
                    _ => String::from("unspecified"),
                };
                self.phase = ConnectionPhase::Closed;
                Ok(vec![ConnectionAction::Close {
                    error: Some(TransportError::PeerShutdown { reason }),
                }])
            },
            Some(Opcode::Error) => {
                let error = match Payload::from_frame(frame) {
                    Ok(Payload::Error(err)) => {
                        TransportError::Remote { code: err.code, message: err.message }
                    },
                    _ => TransportError::Remote { code: 0, message: String::from("malformed error") },
                };
                self.phase = ConnectionPhase::Failed;
                Ok(vec![ConnectionAction::Close { error: Some(error) }])
            },
            _ => Ok(vec![ConnectionAction::Deliver(frame.clone())]),
        }
    }

    /// Check the negotiation window and the inactivity timers.
    pub fn tick(&mut self, now: Instant) -> Vec<ConnectionAction> {
        match self.phase {
            ConnectionPhase::Negotiating => {
                let started = self.negotiation_started.unwrap_or(self.created_at);
                let elapsed = now.saturating_duration_since(started);
                if elapsed >= self.config.negotiation_timeout {
                    self.phase = ConnectionPhase::Failed;
                    return vec![ConnectionAction::Close {
                        error: Some(TransportError::NegotiationTimeout { elapsed }),
                    }];
                }
                vec![]
            },
            ConnectionPhase::Connected => {
                let Some(monitor) = self.monitor.as_mut() else {
                    return vec![];
                };
                match monitor.poll(now) {
                    Some(MonitorEvent::SendKeepAlive) => {
                        vec![ConnectionAction::SendFrame(Frame::keep_alive())]
                    },
                    Some(MonitorEvent::Inactive { elapsed, limit }) => {
                        self.phase = ConnectionPhase::Failed;
                        vec![ConnectionAction::Close {
                            error: Some(TransportError::ConnectionInactive { elapsed, limit }),
                        }]
                    },
                    None => vec![],
                }
            },
            _ => vec![],
        }
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    #[must_use]
    pub fn next_wakeup(&self) -> Option<Instant> {
        match self.phase {
            ConnectionPhase::Negotiating => self
                .negotiation_started
                .map(|started| started + self.config.negotiation_timeout),
            ConnectionPhase::Connected => {
                self.monitor.as_ref().and_then(InactivityMonitor::next_deadline)
            },
            _ => None,
        }
    }

    /// Stamp an outbound application frame and account for the write.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless connected. Callers buffer instead.
    pub fn send(&mut self, mut frame: Frame, now: Instant) -> Result<Frame, TransportError> {
        if self.phase != ConnectionPhase::Connected {
            return Err(TransportError::InvalidState { phase: self.phase, operation: "send" });
        }

        if frame.header.command_id() == 0 {
            frame.header.set_command_id(self.next_command_id);
            self.next_command_id = self.next_command_id.wrapping_add(1).max(1);
        }
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.record_write(now);
        }

        Ok(frame)
    }

    /// Account for a frame written by the driver outside [`send`](Self::send)
    /// (keep-alives, control frames).
    pub fn record_write(&mut self, now: Instant) {
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.record_write(now);
        }
    }

    /// Close the connection.
    ///
    /// A connected peer gets a shutdown frame first; a connection still
    /// negotiating is aborted without one.
    pub fn close(&mut self, reason: &str, now: Instant) -> Vec<ConnectionAction> {
        let was_connected = self.phase == ConnectionPhase::Connected;
        if self.phase.is_terminal() {
            return vec![];
        }
        self.phase = ConnectionPhase::Closed;

        let mut actions = Vec::new();
        if was_connected {
            let shutdown = Payload::Shutdown(ShutdownInfo { reason: reason.to_string() });
            if let Ok(frame) = shutdown.into_frame(FrameHeader::new(Opcode::Shutdown)) {
                self.record_write(now);
                actions.push(ConnectionAction::SendFrame(frame));
            }
        }
        actions.push(ConnectionAction::Close { error: None });
        actions
    }

    /// Mark the connection failed after an error seen by the driver.
    pub fn fail(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = ConnectionPhase::Failed;
        }
    }
}
