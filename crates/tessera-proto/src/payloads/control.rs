//! Connection and cluster control payloads.

use serde::{Deserialize, Serialize};

/// Graceful close notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownInfo {
    /// Why the sender is closing
    pub reason: String,
}

/// Broker-URI list update pushed from a broker to its clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionControl {
    /// Ordered broker connection URIs the client may use
    pub connected_brokers: Vec<String>,
    /// Migrate now
    pub rebalance: bool,
    /// Target broker for the migration; when absent the first entry of
    /// `connected_brokers` is the target
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reconnect_to: Option<String>,
}

/// Broker identity, exchanged between brokers after negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerInfo {
    /// Unique broker name within the cluster
    pub broker_name: String,
    /// Client-facing connector URIs of the sender
    pub connector_uris: Vec<String>,
    /// Rebalanceable clients connected to the sender
    #[serde(default)]
    pub clients: u64,
    /// Other brokers the sender reaches through its own bridges
    #[serde(default)]
    pub peers: Vec<PeerBroker>,
    /// Present when the sender opened this connection as a network bridge
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub network: Option<NetworkAdvert>,
}

/// A broker known indirectly through a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerBroker {
    /// Broker name
    pub broker_name: String,
    /// Client-facing connector URIs
    pub connector_uris: Vec<String>,
    /// Clients connected to that broker, as last reported
    #[serde(default)]
    pub clients: u64,
}

/// Bridge settings the accepting broker needs to mirror a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAdvert {
    /// Bridge name on the initiating broker
    pub bridge_name: String,
    /// Both directions flow over this connection
    pub duplex: bool,
    /// Destination filter expression, if the bridge is scoped
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub destination_filter: Option<String>,
}
