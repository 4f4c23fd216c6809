//! Default dispatch layer for the standalone broker.

use tessera_core::{
    TransportError,
    dispatch::{ConnectionId, ConnectionInfo, Dispatch},
};
use tessera_proto::payloads::message::Message;
use tracing::{debug, info};

/// Logs connection lifecycle and inbound messages, stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDispatch;

impl Dispatch for LoggingDispatch {
    fn connection_established(&self, info: &ConnectionInfo) {
        info!(
            id = %info.id,
            connector = %info.connector,
            remote = %info.remote_addr,
            version = info.wire_format.version,
            max_inactivity = ?info.wire_format.max_inactivity,
            "connection established"
        );
    }

    fn connection_lost(&self, id: ConnectionId, reason: &TransportError) {
        info!(%id, %reason, "connection lost");
    }

    fn message_received(&self, id: ConnectionId, message: &Message) {
        debug!(%id, message = %message.message_id, destination = %message.destination, hops = message.broker_path.len(), "message");
    }
}
