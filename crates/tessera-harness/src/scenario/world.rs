//! World state for scenario execution.

use tessera_core::{TransportError, connection::Connection, wire_format::WireFormatCapabilities};
use tessera_proto::Frame;

/// One end of the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Side that dialed
    Client,
    /// Side that accepted
    Server,
}

impl Side {
    /// The other end
    pub fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

#[derive(Default)]
struct Ledger {
    frames_sent: usize,
    frames_received: usize,
    frames_dropped: usize,
    established: Option<WireFormatCapabilities>,
    delivered: Vec<Frame>,
    close_reason: Option<TransportError>,
}

/// A connected pair and what each side observed.
pub struct World {
    client: Connection,
    server: Connection,
    ledgers: [Ledger; 2],
    partitioned: bool,
}

impl World {
    pub(crate) fn new(client: Connection, server: Connection) -> Self {
        Self { client, server, ledgers: Default::default(), partitioned: false }
    }

    fn ledger(&self, side: Side) -> &Ledger {
        &self.ledgers[side as usize]
    }

    fn ledger_mut(&mut self, side: Side) -> &mut Ledger {
        &mut self.ledgers[side as usize]
    }

    /// Connection of `side`
    pub fn connection(&self, side: Side) -> &Connection {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    pub(crate) fn connection_mut(&mut self, side: Side) -> &mut Connection {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    /// Client connection
    pub fn client(&self) -> &Connection {
        &self.client
    }

    /// Server connection
    pub fn server(&self) -> &Connection {
        &self.server
    }

    /// True once the link has been cut.
    pub fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    pub(crate) fn partition(&mut self) {
        self.partitioned = true;
    }

    /// Frames `side` wrote, including keep-alives and dropped ones.
    pub fn frames_sent(&self, side: Side) -> usize {
        self.ledger(side).frames_sent
    }

    /// Frames that reached `side`.
    pub fn frames_received(&self, side: Side) -> usize {
        self.ledger(side).frames_received
    }

    /// Frames written by `side` that the partition swallowed.
    pub fn frames_dropped(&self, side: Side) -> usize {
        self.ledger(side).frames_dropped
    }

    /// Capabilities reported when `side` finished negotiating.
    pub fn established(&self, side: Side) -> Option<&WireFormatCapabilities> {
        self.ledger(side).established.as_ref()
    }

    /// Application frames delivered to `side`, in order.
    pub fn delivered(&self, side: Side) -> &[Frame] {
        &self.ledger(side).delivered
    }

    /// Why `side` closed, if it did.
    pub fn close_reason(&self, side: Side) -> Option<&TransportError> {
        self.ledger(side).close_reason.as_ref()
    }

    pub(crate) fn record_sent(&mut self, side: Side) {
        self.ledger_mut(side).frames_sent += 1;
    }

    pub(crate) fn record_received(&mut self, side: Side) {
        self.ledger_mut(side).frames_received += 1;
    }

    pub(crate) fn record_dropped(&mut self, side: Side) {
        self.ledger_mut(side).frames_dropped += 1;
    }

    pub(crate) fn record_established(&mut self, side: Side, caps: WireFormatCapabilities) {
        self.ledger_mut(side).established = Some(caps);
    }

    pub(crate) fn record_delivered(&mut self, side: Side, frame: Frame) {
        self.ledger_mut(side).delivered.push(frame);
    }

    pub(crate) fn record_close(&mut self, side: Side, reason: TransportError) {
        let ledger = self.ledger_mut(side);
        if ledger.close_reason.is_none() {
            ledger.close_reason = Some(reason);
        }
    }
}
