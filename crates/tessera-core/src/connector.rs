//! Broker-side transport connector.
//!
//! A connector accepts sockets on one URI, runs a [`Connection`] per socket
//! and keeps the registry of clients it serves. It decides which control
//! frames those clients receive when the cluster changes:
//!
//! | flag | on client established | on member added | on member removed |
//! |------|-----------------------|-----------------|-------------------|
//! | `update_clients` | broker list | broker list | - |
//! | `rebalance_clients` | broker list | broker list | - |
//! | `update_clients_on_remove` | - | - | broker list |
//!
//! With `rebalance_clients`, migrate directives are sent separately by
//! [`TransportConnector::rebalance`], once the cluster's membership and
//! client counts have settled.
//!
//! Clients still negotiating are not in the registry yet and receive
//! nothing.

use std::{collections::BTreeMap, net::SocketAddr, time::Instant};

use tessera_proto::{
    Frame, Payload,
    payloads::control::ConnectionControl,
};
use tracing::{debug, info, warn};

use crate::{
    cluster::{ClusterTopologyManager, MembershipChange},
    connection::{Connection, ConnectionAction, ConnectionConfig},
    dispatch::{ConnectionId, ConnectionInfo},
    error::TransportError,
    uri::BrokerUri,
    wire_format::WireFormatCapabilities,
};

/// Connector configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorConfig {
    /// Connector name (unique per broker)
    pub name: String,
    /// Listen URI, also advertised to clients
    pub uri: BrokerUri,
    /// Instruct clients to migrate when membership changes
    pub rebalance_clients: bool,
    /// Push the broker list when members join
    pub update_clients: bool,
    /// Push the broker list when members leave
    pub update_clients_on_remove: bool,
    /// Per-connection settings; `wireFormat.*` options on `uri` are
    /// applied on top
    pub connection: ConnectionConfig,
}

impl ConnectorConfig {
    /// Plain connector: no cluster notifications.
    #[must_use]
    pub fn new(name: impl Into<String>, uri: BrokerUri) -> Self {
        Self {
            name: name.into(),
            uri,
            rebalance_clients: false,
            update_clients: false,
            update_clients_on_remove: false,
            connection: ConnectionConfig::default(),
        }
    }

    /// Connector that keeps clients informed and balanced.
    #[must_use]
    pub fn clustered(mut self) -> Self {
        self.rebalance_clients = true;
        self.update_clients = true;
        self.update_clients_on_remove = true;
        self
    }

    /// True if any flag makes the connector follow membership events.
    #[must_use]
    pub fn subscribes_to_membership(&self) -> bool {
        self.rebalance_clients || self.update_clients || self.update_clients_on_remove
    }
}

#[derive(Debug, Clone)]
struct ClientEntry {
    remote_addr: SocketAddr,
    established: bool,
}

/// Connector state: configuration plus the client registry.
#[derive(Debug, Clone)]
pub struct TransportConnector {
    config: ConnectorConfig,
    wire_format: WireFormatCapabilities,
    clients: BTreeMap<ConnectionId, ClientEntry>,
}

impl TransportConnector {
    /// Create a connector.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` if the URI carries invalid
    /// `wireFormat.*` options.
    pub fn new(config: ConnectorConfig) -> Result<Self, TransportError> {
        let wire_format = config.connection.wire_format.apply_options(config.uri.options())?;
        Ok(Self { config, wire_format, clients: BTreeMap::new() })
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Connector name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Established clients, oldest first.
    #[must_use]
    pub fn clients(&self) -> Vec<ConnectionId> {
        self.clients.iter().filter(|(_, c)| c.established).map(|(id, _)| *id).collect()
    }

    /// Number of established clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.values().filter(|c| c.established).count()
    }

    /// Register an accepted socket and start negotiating on it.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Protocol` if the negotiation frame cannot
    /// be encoded.
    pub fn accept(
        &mut self,
        id: ConnectionId,
        remote_addr: SocketAddr,
        now: Instant,
    ) -> Result<(Connection, Vec<ConnectionAction>), TransportError> {
        let config =
            ConnectionConfig { wire_format: self.wire_format, ..self.config.connection.clone() };
        let mut connection = Connection::new(now, config);
        let actions = connection.start(now)?;

        self.clients.insert(id, ClientEntry { remote_addr, established: false });
        debug!(connector = %self.config.name, %id, %remote_addr, "accepted");

        Ok((connection, actions))
    }

    /// Negotiation finished on `id`.
    ///
    /// Returns the dispatch snapshot and, if the connector keeps clients
    /// informed, the broker list to send right away.
    pub fn on_established(
        &mut self,
        id: ConnectionId,
        wire_format: WireFormatCapabilities,
        topology: &ClusterTopologyManager,
        now: Instant,
    ) -> Option<(ConnectionInfo, Option<Frame>)> {
        let entry = self.clients.get_mut(&id)?;
        entry.established = true;

        let info = ConnectionInfo {
            id,
            connector: self.config.name.clone(),
            remote_addr: entry.remote_addr,
            wire_format,
            established_at: now,
        };
        info!(connector = %self.config.name, %id, remote = %entry.remote_addr, "client connected");

        let frame = if self.config.update_clients || self.config.rebalance_clients {
            self.control_frame(topology, false, None)
        } else {
            None
        };
        Some((info, frame))
    }

    /// Remove `id` from the client registry (socket closed, or the peer
    /// turned out to be a broker). Returns true if it was established.
    pub fn on_closed(&mut self, id: ConnectionId) -> bool {
        self.clients.remove(&id).is_some_and(|entry| entry.established)
    }

    /// Broker lists to send after a membership change.
    pub fn on_membership_change(
        &self,
        change: &MembershipChange,
        topology: &ClusterTopologyManager,
    ) -> Vec<(ConnectionId, Frame)> {
        let notify = (!change.added.is_empty()
            && (self.config.update_clients || self.config.rebalance_clients))
            || (!change.removed.is_empty() && self.config.update_clients_on_remove);
        if !notify {
            return vec![];
        }

        self.clients()
            .into_iter()
            .filter_map(|id| self.control_frame(topology, false, None).map(|frame| (id, frame)))
            .collect()
    }

    /// Migrate directives for this connector's share of `quota`.
    ///
    /// The newest clients move first; what this connector cannot serve
    /// (no target URI of its scheme, not enough clients) stays in `quota`.
    pub fn rebalance(
        &self,
        topology: &ClusterTopologyManager,
        quota: &mut [(String, u64)],
    ) -> Vec<(ConnectionId, Frame)> {
        if !self.config.rebalance_clients {
            return vec![];
        }

        let clients = self.clients();
        let plan = topology.assign_movers(&clients, self.config.uri.scheme(), quota);
        if plan.is_empty() {
            return vec![];
        }
        info!(
            connector = %self.config.name,
            clients = clients.len(),
            migrating = plan.len(),
            "rebalancing clients"
        );

        plan.into_iter()
            .filter_map(|(id, target)| {
                self.control_frame(topology, true, Some(&target)).map(|frame| (id, frame))
            })
            .collect()
    }

    fn control_frame(
        &self,
        topology: &ClusterTopologyManager,
        rebalance: bool,
        target: Option<&BrokerUri>,
    ) -> Option<Frame> {
        let control = ConnectionControl {
            connected_brokers: topology
                .known_broker_uris(self.config.uri.scheme())
                .iter()
                .map(ToString::to_string)
                .collect(),
            rebalance,
            reconnect_to: target.map(ToString::to_string),
        };
        match Payload::ConnectionControl(control).to_frame() {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!(connector = %self.config.name, %err, "cannot encode connection control");
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use tessera_proto::payloads::control::BrokerInfo;

    use super::*;

    fn uri(s: &str) -> BrokerUri {
        BrokerUri::parse(s).expect("uri")
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn topology_with_peer() -> (ClusterTopologyManager, MembershipChange) {
        let mut topology = ClusterTopologyManager::new("a", vec![uri("tcp://a:1")]);
        let change = topology.bridge_up("to-b", &BrokerInfo {
            broker_name: "b".into(),
            connector_uris: vec!["tcp://b:2".into()],
            clients: 0,
            peers: vec![],
            network: None,
        });
        (topology, change)
    }

    fn established(connector: &mut TransportConnector, count: u64, now: Instant) {
        let topology = ClusterTopologyManager::new("a", vec![uri("tcp://a:1")]);
        for n in 0..count {
            let id = ConnectionId(n);
            connector.accept(id, addr(40_000 + n as u16), now).expect("accept");
            connector.on_established(id, WireFormatCapabilities::default(), &topology, now);
        }
    }

    fn control(frame: &Frame) -> ConnectionControl {
        match Payload::from_frame(frame) {
            Ok(Payload::ConnectionControl(control)) => control,
            other => panic!("expected connection control, got {other:?}"),
        }
    }

    #[test]
    fn accept_starts_negotiation_with_uri_options() {
        let config = ConnectorConfig::new("openwire", uri("tcp://a:1?wireFormat.maxInactivityDuration=0"));
        let mut connector = TransportConnector::new(config).expect("connector");

        let (connection, actions) =
            connector.accept(ConnectionId(1), addr(1), Instant::now()).expect("accept");
        assert_eq!(actions.len(), 1);
        assert!(connection.config().wire_format.max_inactivity.is_zero());
        assert_eq!(connector.client_count(), 0);
    }

    #[test]
    fn invalid_uri_options_fail_construction() {
        let config = ConnectorConfig::new("openwire", uri("tcp://a:1?wireFormat.bogus=1"));
        assert!(matches!(TransportConnector::new(config), Err(TransportError::Config(_))));
    }

    #[test]
    fn plain_connector_sends_nothing() {
        let now = Instant::now();
        let mut connector =
            TransportConnector::new(ConnectorConfig::new("c", uri("tcp://a:1"))).expect("connector");
        let (topology, change) = topology_with_peer();

        connector.accept(ConnectionId(1), addr(1), now).expect("accept");
        let (info, frame) = connector
            .on_established(ConnectionId(1), WireFormatCapabilities::default(), &topology, now)
            .expect("registered");
        assert_eq!(info.connector, "c");
        assert!(frame.is_none());
        assert!(connector.on_membership_change(&change, &topology).is_empty());
    }

    #[test]
    fn update_clients_pushes_list_on_establish_and_join() {
        let now = Instant::now();
        let config = ConnectorConfig { update_clients: true, ..ConnectorConfig::new("c", uri("tcp://a:1")) };
        let mut connector = TransportConnector::new(config).expect("connector");
        let (topology, change) = topology_with_peer();

        connector.accept(ConnectionId(1), addr(1), now).expect("accept");
        let (_, frame) = connector
            .on_established(ConnectionId(1), WireFormatCapabilities::default(), &topology, now)
            .expect("registered");
        let pushed = control(&frame.expect("broker list"));
        assert_eq!(pushed.connected_brokers, vec!["tcp://a:1", "tcp://b:2"]);
        assert!(!pushed.rebalance);

        let frames = connector.on_membership_change(&change, &topology);
        assert_eq!(frames.len(), 1);

        let removal = MembershipChange { added: vec![], removed: vec!["c".into()] };
        assert!(connector.on_membership_change(&removal, &topology).is_empty());
    }

    #[test]
    fn update_on_remove_pushes_list_on_leave_only() {
        let now = Instant::now();
        let config = ConnectorConfig {
            update_clients_on_remove: true,
            ..ConnectorConfig::new("c", uri("tcp://a:1"))
        };
        let mut connector = TransportConnector::new(config).expect("connector");
        established(&mut connector, 2, now);
        let (topology, change) = topology_with_peer();

        assert!(connector.on_membership_change(&change, &topology).is_empty());

        let removal = MembershipChange { added: vec![], removed: vec!["c".into()] };
        assert_eq!(connector.on_membership_change(&removal, &topology).len(), 2);
    }

    #[test]
    fn rebalance_directs_newest_clients_to_new_member() {
        let now = Instant::now();
        let config = ConnectorConfig::new("c", uri("tcp://a:1")).clustered();
        let mut connector = TransportConnector::new(config).expect("connector");
        established(&mut connector, 30, now);
        let (mut topology, change) = topology_with_peer();
        topology.set_local_clients(30);

        let lists = connector.on_membership_change(&change, &topology);
        assert_eq!(lists.len(), 30);
        assert!(lists.iter().all(|(_, frame)| !control(frame).rebalance));

        let mut quota = topology.rebalance_quota();
        let frames = connector.rebalance(&topology, &mut quota);
        let migrating: Vec<ConnectionId> = frames.iter().map(|(id, _)| *id).collect();
        assert_eq!(migrating, (15..30).map(ConnectionId).collect::<Vec<_>>());
        assert_eq!(quota, vec![("b".to_string(), 0)]);

        let directive = control(&frames[14].1);
        assert!(directive.rebalance);
        assert_eq!(directive.reconnect_to.as_deref(), Some("tcp://b:2"));
    }

    #[test]
    fn rebalance_is_off_without_flag() {
        let now = Instant::now();
        let config = ConnectorConfig { update_clients: true, ..ConnectorConfig::new("c", uri("tcp://a:1")) };
        let mut connector = TransportConnector::new(config).expect("connector");
        established(&mut connector, 10, now);
        let (mut topology, _) = topology_with_peer();
        topology.set_local_clients(10);

        let mut quota = topology.rebalance_quota();
        assert!(connector.rebalance(&topology, &mut quota).is_empty());
        assert_eq!(quota, vec![("b".to_string(), 5)]);
    }

    #[test]
    fn negotiating_clients_are_not_notified() {
        let now = Instant::now();
        let config = ConnectorConfig::new("c", uri("tcp://a:1")).clustered();
        let mut connector = TransportConnector::new(config).expect("connector");
        connector.accept(ConnectionId(1), addr(1), now).expect("accept");
        let (topology, change) = topology_with_peer();

        assert!(connector.on_membership_change(&change, &topology).is_empty());
        let mut quota = vec![("b".to_string(), 1)];
        assert!(connector.rebalance(&topology, &mut quota).is_empty());
        assert!(!connector.on_closed(ConnectionId(1)));
    }
}
