//! Cluster membership and client rebalancing.
//!
//! Membership is derived, never edited directly: it is whatever the live
//! bridges currently report. Every bridge contributes a view made of the
//! broker at its far end plus the peers that broker advertised. Adding,
//! refreshing or dropping a view recomputes the member set and yields the
//! [`MembershipChange`] connectors react to.
//!
//! # Propagation
//!
//! Brokers exchange [`BrokerInfo`] over every bridge. The `peers` field of
//! an advertisement lists what the sender knows through its *other*
//! bridges (split horizon), so a peer is never echoed back over the bridge
//! it was learned from, and a chain `A - B - C` converges to three members
//! on every broker.
//!
//! Advertisements also carry client counts: the sender's own and the last
//! count it heard for every peer it lists.
//!
//! # Rebalancing
//!
//! Each broker only moves its own clients, but plans against the whole
//! cluster. With `K` members and `T` clients in total, every member's
//! target is `T / K`, and the `T % K` remainder units go to the most
//! loaded members (ties by name) so a cluster already within one client
//! of even stays put. Members above target are then matched with members
//! below it, both in name order. Every broker computes the same matching
//! from the same counts and carries out only its own row, newest clients
//! first.
//!
//! Planning is idempotent over settled counts, so callers re-plan whenever
//! counts or membership change; a broker that planned from a stale view
//! is corrected by the next round.

use std::collections::{BTreeMap, BTreeSet};

use tessera_proto::payloads::control::{BrokerInfo, PeerBroker};
use tracing::{debug, info, warn};

use crate::{dispatch::ConnectionId, uri::BrokerUri};

/// One broker in the cluster, as seen from the local broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerClusterMember {
    /// Unique name within the cluster
    pub name: String,
    /// Client-facing connector URIs
    pub connector_uris: Vec<BrokerUri>,
    /// Live bridges through which this member is known (for the local
    /// broker: all live bridges)
    pub bridges: BTreeSet<String>,
}

/// Difference between two member sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    /// Members that appeared
    pub added: Vec<String>,
    /// Members that disappeared
    pub removed: Vec<String>,
}

impl MembershipChange {
    /// True if the member set did not change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemberView {
    uris: Vec<BrokerUri>,
    clients: u64,
}

impl MemberView {
    fn from_advert(uris: &[String], clients: u64) -> Self {
        Self { uris: parse_uris(uris), clients }
    }
}

#[derive(Debug, Clone)]
struct BridgeView {
    remote: String,
    remote_view: MemberView,
    peers: Vec<(String, MemberView)>,
}

/// Clients one member should hand to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Member giving up clients
    pub from: String,
    /// Member receiving them
    pub to: String,
    /// Number of clients
    pub count: u64,
}

/// Per-broker membership registry.
#[derive(Debug, Clone)]
pub struct ClusterTopologyManager {
    local_name: String,
    local_uris: Vec<BrokerUri>,
    local_clients: u64,
    bridges: BTreeMap<String, BridgeView>,
    members: BTreeMap<String, MemberView>,
    advertised: BTreeMap<String, BrokerInfo>,
    rebalance_due: bool,
}

impl ClusterTopologyManager {
    /// Registry containing only the local broker.
    ///
    /// `local_uris` are the URIs clients are told about: the connectors
    /// that take part in cluster updates.
    #[must_use]
    pub fn new(local_name: impl Into<String>, local_uris: Vec<BrokerUri>) -> Self {
        Self {
            local_name: local_name.into(),
            local_uris,
            local_clients: 0,
            bridges: BTreeMap::new(),
            members: BTreeMap::new(),
            advertised: BTreeMap::new(),
            rebalance_due: false,
        }
    }

    /// Name of the local broker
    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Client-facing URIs of the local broker
    #[must_use]
    pub fn local_uris(&self) -> &[BrokerUri] {
        &self.local_uris
    }

    /// Clients of the local broker that rebalancing may move
    #[must_use]
    pub fn local_clients(&self) -> u64 {
        self.local_clients
    }

    /// Record the local client count. Returns true if it changed.
    pub fn set_local_clients(&mut self, clients: u64) -> bool {
        if self.local_clients == clients {
            return false;
        }
        self.local_clients = clients;
        self.rebalance_due = true;
        true
    }

    /// Last known client count of a member.
    #[must_use]
    pub fn clients_of(&self, name: &str) -> Option<u64> {
        if name == self.local_name {
            return Some(self.local_clients);
        }
        self.members.get(name).map(|view| view.clients)
    }

    /// True once, after membership or any client count changed since the
    /// last call.
    pub fn take_rebalance_due(&mut self) -> bool {
        std::mem::take(&mut self.rebalance_due)
    }

    /// Number of members, local broker included.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len() + 1
    }

    /// True if `name` is the local broker or a known peer.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        name == self.local_name || self.members.contains_key(name)
    }

    /// Live bridge keys
    pub fn bridges(&self) -> impl Iterator<Item = &str> {
        self.bridges.keys().map(String::as_str)
    }

    /// Record (or refresh) what the broker behind `bridge` reported.
    pub fn bridge_up(&mut self, bridge: &str, info: &BrokerInfo) -> MembershipChange {
        if info.broker_name == self.local_name {
            warn!(bridge, broker = %info.broker_name, "bridge loops back to the local broker");
            return MembershipChange::default();
        }

        let view = BridgeView {
            remote: info.broker_name.clone(),
            remote_view: MemberView::from_advert(&info.connector_uris, info.clients),
            peers: info
                .peers
                .iter()
                .filter(|peer| peer.broker_name != self.local_name)
                .map(|peer| {
                    (peer.broker_name.clone(), MemberView::from_advert(&peer.connector_uris, peer.clients))
                })
                .collect(),
        };
        if self.bridges.insert(bridge.to_string(), view).is_none() {
            debug!(bridge, remote = %info.broker_name, "bridge registered");
        }

        self.recompute()
    }

    /// Forget everything `bridge` reported.
    pub fn bridge_down(&mut self, bridge: &str) -> MembershipChange {
        self.advertised.remove(bridge);
        if self.bridges.remove(bridge).is_none() {
            return MembershipChange::default();
        }
        debug!(bridge, "bridge removed");
        self.recompute()
    }

    /// All members: the local broker first, then peers by name.
    #[must_use]
    pub fn members(&self) -> Vec<BrokerClusterMember> {
        let mut members = vec![BrokerClusterMember {
            name: self.local_name.clone(),
            connector_uris: self.local_uris.clone(),
            bridges: self.bridges.keys().cloned().collect(),
        }];
        for (name, view) in &self.members {
            let bridges = self
                .bridges
                .iter()
                .filter(|(_, view)| {
                    view.remote == *name || view.peers.iter().any(|(peer, _)| peer == name)
                })
                .map(|(key, _)| key.clone())
                .collect();
            members.push(BrokerClusterMember {
                name: name.clone(),
                connector_uris: view.uris.clone(),
                bridges,
            });
        }
        members
    }

    /// Client-facing URIs of every member with the given scheme, local
    /// broker first.
    #[must_use]
    pub fn known_broker_uris(&self, scheme: &str) -> Vec<BrokerUri> {
        self.local_uris
            .iter()
            .chain(self.members.values().flat_map(|view| &view.uris))
            .filter(|uri| uri.scheme() == scheme)
            .cloned()
            .collect()
    }

    /// Advertisement to send over `bridge`, recorded as sent.
    pub fn advertise(&mut self, bridge: &str) -> BrokerInfo {
        let info = self.advertisement_for(bridge);
        self.advertised.insert(bridge.to_string(), info.clone());
        info
    }

    /// Advertisement for `bridge`: the local broker plus every peer not
    /// learned through that bridge.
    #[must_use]
    pub fn advertisement_for(&self, bridge: &str) -> BrokerInfo {
        let remote = self.bridges.get(bridge).map(|view| view.remote.as_str());
        let peers = self
            .collect_members(Some(bridge))
            .into_iter()
            .filter(|(name, _)| Some(name.as_str()) != remote)
            .map(|(name, view)| PeerBroker {
                broker_name: name,
                connector_uris: view.uris.iter().map(ToString::to_string).collect(),
                clients: view.clients,
            })
            .collect();

        BrokerInfo {
            broker_name: self.local_name.clone(),
            connector_uris: self.local_uris.iter().map(ToString::to_string).collect(),
            clients: self.local_clients,
            peers,
            network: None,
        }
    }

    /// Advertisements whose content changed since they were last sent.
    pub fn take_advertisements(&mut self) -> Vec<(String, BrokerInfo)> {
        let keys: Vec<String> = self.bridges.keys().cloned().collect();
        let mut changed = Vec::new();
        for key in keys {
            let info = self.advertisement_for(&key);
            if self.advertised.get(&key) != Some(&info) {
                self.advertised.insert(key.clone(), info.clone());
                changed.push((key, info));
            }
        }
        changed
    }

    /// Cluster-wide transfers that bring every member within one client of
    /// the average, computed from the last known counts.
    ///
    /// Members without client-facing URIs cannot receive clients and do not
    /// take part.
    #[must_use]
    pub fn plan_transfers(&self) -> Vec<Transfer> {
        let mut loads: Vec<(&str, u64)> = vec![(self.local_name.as_str(), self.local_clients)];
        loads.extend(
            self.members
                .iter()
                .filter(|(_, view)| !view.uris.is_empty())
                .map(|(name, view)| (name.as_str(), view.clients)),
        );
        loads.sort_by(|a, b| a.0.cmp(b.0));

        let k = loads.len() as u64;
        let total: u64 = loads.iter().map(|(_, clients)| clients).sum();
        if k < 2 || total == 0 {
            return vec![];
        }

        let mut targets = vec![total / k; loads.len()];
        let mut heaviest: Vec<usize> = (0..loads.len()).collect();
        heaviest.sort_by(|a, b| loads[*b].1.cmp(&loads[*a].1).then(loads[*a].0.cmp(loads[*b].0)));
        for index in heaviest.into_iter().take((total % k) as usize) {
            targets[index] += 1;
        }

        let mut surplus: Vec<(usize, u64)> = Vec::new();
        let mut deficit: Vec<(usize, u64)> = Vec::new();
        for (index, ((_, clients), target)) in loads.iter().zip(&targets).enumerate() {
            if clients > target {
                surplus.push((index, clients - target));
            } else if clients < target {
                deficit.push((index, target - clients));
            }
        }

        let mut transfers = Vec::new();
        let mut receivers = deficit.into_iter();
        let mut receiver = receivers.next();
        for (giver, mut excess) in surplus {
            while excess > 0 {
                let Some((to, wanted)) = receiver.as_mut() else {
                    break;
                };
                let count = excess.min(*wanted);
                transfers.push(Transfer {
                    from: loads[giver].0.to_string(),
                    to: loads[*to].0.to_string(),
                    count,
                });
                excess -= count;
                *wanted -= count;
                if *wanted == 0 {
                    receiver = receivers.next();
                }
            }
        }
        transfers
    }

    /// How many local clients go to which member.
    #[must_use]
    pub fn rebalance_quota(&self) -> Vec<(String, u64)> {
        self.plan_transfers()
            .into_iter()
            .filter(|transfer| transfer.from == self.local_name)
            .map(|transfer| (transfer.to, transfer.count))
            .collect()
    }

    /// Assign clients of one connector to the members in `quota`, using
    /// up the quota as it goes.
    ///
    /// `clients` must be ordered oldest first; the newest move. Members
    /// without a connector URI of `scheme` are skipped and keep their
    /// quota for another connector.
    pub fn assign_movers(
        &self,
        clients: &[ConnectionId],
        scheme: &str,
        quota: &mut [(String, u64)],
    ) -> Vec<(ConnectionId, BrokerUri)> {
        let mut slots = Vec::new();
        for (member, count) in quota.iter_mut() {
            let uri = self
                .members
                .get(member.as_str())
                .and_then(|view| view.uris.iter().find(|uri| uri.scheme() == scheme));
            let Some(uri) = uri else {
                continue;
            };
            let room = clients.len().saturating_sub(slots.len()) as u64;
            let take = (*count).min(room);
            *count -= take;
            slots.extend(std::iter::repeat_n(uri.clone(), take as usize));
        }

        let movers = &clients[clients.len() - slots.len()..];
        movers.iter().copied().zip(slots).collect()
    }

    /// The local share of [`plan_transfers`](Self::plan_transfers) for a
    /// single connector's clients, oldest first.
    #[must_use]
    pub fn plan_rebalance(
        &self,
        clients: &[ConnectionId],
        scheme: &str,
    ) -> Vec<(ConnectionId, BrokerUri)> {
        let mut quota = self.rebalance_quota();
        self.assign_movers(clients, scheme, &mut quota)
    }

    fn recompute(&mut self) -> MembershipChange {
        let next = self.collect_members(None);

        let added: Vec<String> =
            next.keys().filter(|name| !self.members.contains_key(*name)).cloned().collect();
        let removed: Vec<String> =
            self.members.keys().filter(|name| !next.contains_key(*name)).cloned().collect();

        if self.members != next {
            self.rebalance_due = true;
        }
        self.members = next;
        let change = MembershipChange { added, removed };
        if !change.is_empty() {
            info!(
                broker = %self.local_name,
                added = ?change.added,
                removed = ?change.removed,
                members = self.member_count(),
                "cluster membership changed"
            );
        }
        change
    }

    fn collect_members(&self, excluding: Option<&str>) -> BTreeMap<String, MemberView> {
        let mut direct = BTreeMap::new();
        let mut indirect = BTreeMap::new();

        for (key, view) in &self.bridges {
            if Some(key.as_str()) == excluding {
                continue;
            }
            direct.entry(view.remote.clone()).or_insert_with(|| view.remote_view.clone());
            for (name, peer) in &view.peers {
                indirect.entry(name.clone()).or_insert_with(|| peer.clone());
            }
        }
        for (name, peer) in indirect {
            direct.entry(name).or_insert(peer);
        }
        direct.remove(&self.local_name);
        direct
    }
}

fn parse_uris(raw: &[String]) -> Vec<BrokerUri> {
    raw.iter()
        .filter_map(|uri| match BrokerUri::parse(uri) {
            Ok(uri) => Some(uri),
            Err(err) => {
                warn!(%uri, %err, "ignoring unparseable advertised URI");
                None
            },
        })
        .collect()
}
