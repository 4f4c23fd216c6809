//! Dispatch layer that records what a broker reports.

use std::{
    collections::BTreeSet,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tessera_core::{
    TransportError,
    dispatch::{ConnectionId, ConnectionInfo, Dispatch},
    wire_format::WireFormatCapabilities,
};
use tessera_proto::payloads::message::Message;

/// One dispatch callback, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchRecord {
    /// `connection_established`
    Established {
        /// Connection id
        id: ConnectionId,
        /// Peer address
        remote: SocketAddr,
        /// Negotiated capabilities
        wire_format: WireFormatCapabilities,
    },
    /// `connection_lost`
    Lost {
        /// Connection id
        id: ConnectionId,
        /// Why it ended
        reason: TransportError,
    },
    /// `message_received`
    Message {
        /// Connection or bridge it came from
        id: ConnectionId,
        /// The message
        message: Message,
    },
}

/// Shareable recording dispatch. Clones share one log.
#[derive(Debug, Clone, Default)]
pub struct RecordingDispatch {
    log: Arc<Mutex<Vec<DispatchRecord>>>,
}

impl RecordingDispatch {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> MutexGuard<'_, Vec<DispatchRecord>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything recorded so far
    pub fn records(&self) -> Vec<DispatchRecord> {
        self.log().clone()
    }

    /// Ids of received messages, in arrival order.
    pub fn message_ids(&self) -> Vec<String> {
        self.log()
            .iter()
            .filter_map(|record| match record {
                DispatchRecord::Message { message, .. } => Some(message.message_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Connections established and not yet lost.
    pub fn active(&self) -> BTreeSet<ConnectionId> {
        let mut active = BTreeSet::new();
        for record in self.log().iter() {
            match record {
                DispatchRecord::Established { id, .. } => {
                    active.insert(*id);
                },
                DispatchRecord::Lost { id, .. } => {
                    active.remove(id);
                },
                DispatchRecord::Message { .. } => {},
            }
        }
        active
    }

    /// Capabilities of every established connection, in order.
    pub fn negotiated(&self) -> Vec<WireFormatCapabilities> {
        self.log()
            .iter()
            .filter_map(|record| match record {
                DispatchRecord::Established { wire_format, .. } => Some(*wire_format),
                _ => None,
            })
            .collect()
    }

    /// Reasons of every lost connection.
    pub fn lost_reasons(&self) -> Vec<TransportError> {
        self.log()
            .iter()
            .filter_map(|record| match record {
                DispatchRecord::Lost { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Dispatch for RecordingDispatch {
    fn connection_established(&self, info: &ConnectionInfo) {
        self.log().push(DispatchRecord::Established {
            id: info.id,
            remote: info.remote_addr,
            wire_format: info.wire_format,
        });
    }

    fn connection_lost(&self, id: ConnectionId, reason: &TransportError) {
        self.log().push(DispatchRecord::Lost { id, reason: reason.clone() });
    }

    fn message_received(&self, id: ConnectionId, message: &Message) {
        self.log().push(DispatchRecord::Message { id, message: message.clone() });
    }
}
