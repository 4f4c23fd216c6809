//! Shared helpers for the turmoil integration tests.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use tessera_broker::{Broker, BrokerConfig};
use tessera_client::ClientEvent;
use tessera_core::{bridge::BridgeConfig, connector::ConnectorConfig, uri::BrokerUri};
use tessera_harness::{RecordingDispatch, SimEnv, sim_registry};
use tokio::sync::mpsc;

/// Listen port of every simulated broker
pub const PORT: u16 = 61616;

/// Simulation with a fixed seed and a generous virtual time budget.
pub fn sim(seed: u64, duration: Duration) -> turmoil::Sim<'static> {
    turmoil::Builder::new().simulation_duration(duration).rng_seed(seed).build()
}

/// `tcp://host:61616` plus optional query options.
pub fn broker_uri(host: &str, options: &str) -> BrokerUri {
    let query = if options.is_empty() { String::new() } else { format!("?{options}") };
    BrokerUri::parse(&format!("tcp://{host}:{PORT}{query}")).expect("broker uri")
}

/// Clustered connector on `host`.
pub fn clustered(host: &str, options: &str) -> ConnectorConfig {
    ConnectorConfig::new("openwire", broker_uri(host, options)).clustered()
}

/// Duplex bridge to `remote` with a short reconnect delay.
pub fn duplex_bridge(name: &str, remote: &str) -> BridgeConfig {
    let mut bridge = BridgeConfig::new(name, broker_uri(remote, ""));
    bridge.duplex = true;
    bridge.backoff.initial = Duration::from_millis(200);
    bridge
}

/// Run a broker on `host`, starting after `delay` of virtual time.
pub fn spawn_broker(
    sim: &mut turmoil::Sim<'static>,
    host: &str,
    config: BrokerConfig,
    dispatch: RecordingDispatch,
    delay: Duration,
) {
    let seed = host.bytes().map(u64::from).sum();
    sim.host(host, move || {
        let config = config.clone();
        let dispatch = dispatch.clone();
        async move {
            tokio::time::sleep(delay).await;
            let broker =
                Broker::start(config, SimEnv::with_seed(seed), sim_registry(), Arc::new(dispatch)).await?;
            std::future::pending::<()>().await;
            broker.shutdown().await;
            Ok(())
        }
    });
}

/// Receive events until one matches, failing after `within` of virtual
/// time.
pub async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    within: Duration,
    matches: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) if matches(&event) => return event,
            Ok(Some(_)) => {},
            Ok(None) => panic!("client stopped"),
            Err(_) => panic!("no matching event within {within:?}"),
        }
    }
}

/// Poll `check` every 50ms of virtual time until it holds.
pub async fn eventually(what: &str, within: Duration, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + within;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
