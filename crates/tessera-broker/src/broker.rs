//! Broker runtime.
//!
//! One [`Broker`] value is one broker instance. Everything it shares
//! between tasks lives in a single [`BrokerState`] behind one mutex: the
//! cluster topology, the connectors with their client registries, the
//! command channels of every connection task and the bridge table. Several
//! brokers can run in one process; they share nothing.
//!
//! # Tasks
//!
//! - one accept loop per connector
//! - one task per accepted connection (client, or mirror bridge once the
//!   peer identifies itself as a bridging broker)
//! - one task per configured bridge
//! - one rebalancer, which re-plans client placement once membership and
//!   client counts have been quiet for [`REBALANCE_SETTLE`]
//!
//! Tasks take the lock only to read or update shared state and never hold
//! it across an await. Dispatch callbacks run after the lock is released.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tessera_core::{
    bridge::{BridgeConfig, BridgeStatus, NetworkBridge},
    cluster::{BrokerClusterMember, ClusterTopologyManager, MembershipChange},
    connector::TransportConnector,
    dispatch::{ConnectionId, Dispatch},
    env::Environment,
    transport::{TransportListener, TransportRegistry},
    uri::BrokerUri,
};
use tessera_proto::payloads::message::Message;
use tokio::sync::{Notify, mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace};

use crate::{
    config::BrokerConfig,
    error::BrokerError,
    peer::{PeerCommand, PeerTask},
};

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Quiet period before client placement is re-planned.
pub const REBALANCE_SETTLE: Duration = Duration::from_millis(500);

/// A running broker.
pub struct Broker<E> {
    shared: Arc<Shared<E>>,
}

pub(crate) struct Shared<E> {
    pub(crate) name: String,
    pub(crate) env: E,
    pub(crate) registry: TransportRegistry,
    pub(crate) dispatch: Arc<dyn Dispatch>,
    pub(crate) cancel: CancellationToken,
    pub(crate) tasks: TaskTracker,
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
}

impl<E> Shared<E> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Shared state of one broker instance.
pub(crate) struct BrokerState {
    pub(crate) topology: ClusterTopologyManager,
    pub(crate) connector_uris: Vec<BrokerUri>,
    pub(crate) rebalance: Arc<Notify>,
    pub(crate) connectors: BTreeMap<String, TransportConnector>,
    pub(crate) peers: BTreeMap<ConnectionId, mpsc::UnboundedSender<PeerCommand>>,
    pub(crate) bridges: BTreeMap<String, BridgeEntry>,
}

/// Bridge table row. `id` identifies the task that owns the bridge; events
/// from any other task under the same key are stale.
#[derive(Debug, Clone)]
pub(crate) struct BridgeEntry {
    pub(crate) id: ConnectionId,
    pub(crate) status: BridgeStatus,
    pub(crate) mirror: bool,
}

impl BrokerState {
    pub(crate) fn send(&self, id: ConnectionId, command: PeerCommand) {
        if let Some(peer) = self.peers.get(&id) {
            let _ = peer.send(command);
        }
    }

    pub(crate) fn owns_bridge(&self, key: &str, id: ConnectionId) -> bool {
        self.bridges.get(key).is_some_and(|entry| entry.id == id)
    }

    /// Push what a membership change implies: broker lists to clients,
    /// refreshed advertisements to bridges. Also called when only a peer's
    /// client count changed, so the rebalancer hears about it.
    pub(crate) fn membership_changed(&mut self, change: &MembershipChange) {
        for connector in self.connectors.values() {
            for (id, frame) in connector.on_membership_change(change, &self.topology) {
                self.send(id, PeerCommand::Send(frame));
            }
        }
        self.announce();
    }

    /// A client was established or went away.
    pub(crate) fn clients_changed(&mut self) {
        let clients: usize = self
            .connectors
            .values()
            .filter(|connector| connector.config().rebalance_clients)
            .map(TransportConnector::client_count)
            .sum();
        self.topology.set_local_clients(clients as u64);
        self.announce();
    }

    fn announce(&mut self) {
        for (key, info) in self.topology.take_advertisements() {
            if let Some(entry) = self.bridges.get(&key) {
                self.send(entry.id, PeerCommand::Announce(info));
            }
        }
        if self.topology.take_rebalance_due() {
            self.rebalance.notify_one();
        }
    }

    /// Send migrate directives for the local share of the cluster-wide
    /// plan.
    pub(crate) fn rebalance(&self) {
        let mut quota = self.topology.rebalance_quota();
        if quota.is_empty() {
            trace!(broker = %self.topology.local_name(), "cluster balanced");
            return;
        }
        debug!(broker = %self.topology.local_name(), ?quota, "rebalancing");
        for connector in self.connectors.values() {
            for (id, frame) in connector.rebalance(&self.topology, &mut quota) {
                self.send(id, PeerCommand::Send(frame));
            }
        }
    }

    /// Offer `message` to every bridge except the one it came from. Each
    /// bridge applies its own direction, filter and loop rules.
    pub(crate) fn route(&self, message: &Message, from: Option<ConnectionId>) {
        for entry in self.bridges.values() {
            if Some(entry.id) != from {
                self.send(entry.id, PeerCommand::Forward(message.clone()));
            }
        }
    }
}

impl<E> Broker<E>
where
    E: Environment<Instant = Instant>,
{
    /// Bind every connector, start every bridge, and return the running
    /// broker.
    ///
    /// Connectors configured with port 0 are bound to an ephemeral port;
    /// the bound port is what clients and peers are told.
    ///
    /// # Errors
    ///
    /// - `BrokerError::Config` for cross-field violations
    /// - `BrokerError::Transport` for unknown URI schemes or invalid
    ///   connector options
    /// - `BrokerError::Bind` if a connector cannot listen
    pub async fn start(
        config: BrokerConfig,
        env: E,
        registry: TransportRegistry,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<Self, BrokerError> {
        config.validate()?;
        for bridge in &config.bridges {
            registry.resolve(&bridge.remote)?;
        }

        let mut connectors = BTreeMap::new();
        let mut listeners: Vec<(String, Box<dyn TransportListener>)> = Vec::new();
        let mut uris = Vec::new();
        let mut clustered = Vec::new();
        for mut connector in config.connectors {
            let transport = registry.resolve(&connector.uri)?;
            let listener = transport
                .bind(&connector.uri)
                .await
                .map_err(|source| BrokerError::Bind { uri: connector.uri.to_string(), source })?;
            if connector.uri.port() == 0 {
                let port = listener
                    .local_addr()
                    .map_err(|source| BrokerError::Bind { uri: connector.uri.to_string(), source })?
                    .port();
                connector.uri = connector.uri.with_port(port);
            }
            info!(broker = %config.name, connector = %connector.name, uri = %connector.uri, "connector listening");

            uris.push(connector.uri.clone());
            if connector.subscribes_to_membership() {
                clustered.push(connector.uri.clone());
            }
            let name = connector.name.clone();
            connectors.insert(name.clone(), TransportConnector::new(connector)?);
            listeners.push((name, listener));
        }

        let rebalance = Arc::new(Notify::new());
        let state = BrokerState {
            topology: ClusterTopologyManager::new(config.name.clone(), clustered),
            connector_uris: uris,
            rebalance: Arc::clone(&rebalance),
            connectors,
            peers: BTreeMap::new(),
            bridges: BTreeMap::new(),
        };
        let shared = Arc::new(Shared {
            name: config.name,
            env,
            registry,
            dispatch,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            state: Mutex::new(state),
            next_id: AtomicU64::new(1),
        });

        for (connector, listener) in listeners {
            shared.tasks.spawn(accept_loop(Arc::clone(&shared), connector, listener));
        }
        shared.tasks.spawn(rebalance_loop(Arc::clone(&shared), rebalance));

        let broker = Self { shared };
        for bridge in config.bridges {
            broker.add_bridge(bridge)?;
        }
        info!(broker = %broker.name(), "broker started");
        Ok(broker)
    }

    /// Broker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// URIs of every connector, with bound ports. Only connectors that
    /// follow membership are advertised to the cluster.
    #[must_use]
    pub fn connector_uris(&self) -> Vec<BrokerUri> {
        self.shared.lock().connector_uris.clone()
    }

    /// Established client connections across all connectors.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.lock().connectors.values().map(TransportConnector::client_count).sum()
    }

    /// Current cluster members, this broker first.
    #[must_use]
    pub fn members(&self) -> Vec<BrokerClusterMember> {
        self.shared.lock().topology.members()
    }

    /// Status of every bridge, initiated and mirrored, by key.
    #[must_use]
    pub fn bridges(&self) -> BTreeMap<String, BridgeStatus> {
        self.shared
            .lock()
            .bridges
            .iter()
            .map(|(key, entry)| (key.clone(), entry.status))
            .collect()
    }

    /// Inject a locally produced message. It is offered to every bridge.
    pub fn publish(&self, message: Message) {
        debug!(broker = %self.shared.name, id = %message.message_id, destination = %message.destination, "publish");
        self.shared.lock().route(&message, None);
    }

    /// Start an outbound bridge.
    ///
    /// # Errors
    ///
    /// - `BrokerError::Stopped` after shutdown
    /// - `BrokerError::DuplicateBridge` if the name is taken
    /// - `BrokerError::Transport` for an unknown URI scheme
    pub fn add_bridge(&self, config: BridgeConfig) -> Result<(), BrokerError> {
        if self.shared.cancel.is_cancelled() {
            return Err(BrokerError::Stopped);
        }
        self.shared.registry.resolve(&config.remote)?;

        let id = self.shared.next_connection_id();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.lock();
            if state.bridges.contains_key(&config.name) {
                return Err(BrokerError::DuplicateBridge(config.name));
            }
            state.bridges.insert(
                config.name.clone(),
                BridgeEntry { id, status: BridgeStatus::Down, mirror: false },
            );
            state.peers.insert(id, commands);
        }

        info!(broker = %self.shared.name, bridge = %config.name, remote = %config.remote, duplex = config.duplex, "starting bridge");
        let key = config.name.clone();
        let bridge = NetworkBridge::new(config, self.shared.name.clone(), self.shared.env.now());
        PeerTask::spawn_bridge(&self.shared, id, key, bridge, commands_rx);
        Ok(())
    }

    /// Stop an outbound bridge. Returns false if no such bridge runs.
    pub fn remove_bridge(&self, name: &str) -> bool {
        let state = self.shared.lock();
        match state.bridges.get(name) {
            Some(entry) if !entry.mirror => {
                state.send(entry.id, PeerCommand::Stop);
                true
            },
            _ => false,
        }
    }

    /// True once [`shutdown`](Self::shutdown) has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Stop accepting, close every connection and bridge, and wait for all
    /// broker tasks to finish.
    pub async fn shutdown(&self) {
        info!(broker = %self.shared.name, "broker shutting down");
        self.shared.cancel.cancel();
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        info!(broker = %self.shared.name, "broker stopped");
    }
}

async fn accept_loop<E>(shared: Arc<Shared<E>>, connector: String, listener: Box<dyn TransportListener>)
where
    E: Environment<Instant = Instant>,
{
    loop {
        tokio::select! {
            biased;

            () = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => PeerTask::spawn_client(&shared, &connector, stream),
                Err(err) => {
                    error!(broker = %shared.name, %connector, %err, "accept failed");
                    shared.env.sleep(ACCEPT_RETRY_DELAY).await;
                },
            },
        }
    }
    debug!(broker = %shared.name, %connector, "accept loop stopped");
}

async fn rebalance_loop<E>(shared: Arc<Shared<E>>, signal: Arc<Notify>)
where
    E: Environment<Instant = Instant>,
{
    'outer: loop {
        tokio::select! {
            biased;

            () = shared.cancel.cancelled() => break,
            () = signal.notified() => {},
        }
        loop {
            tokio::select! {
                biased;

                () = shared.cancel.cancelled() => break 'outer,
                () = signal.notified() => {},
                () = shared.env.sleep(REBALANCE_SETTLE) => break,
            }
        }
        shared.lock().rebalance();
    }
    debug!(broker = %shared.name, "rebalancer stopped");
}
