//! Client failover across brokers under the simulated network.

mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use common::{broker_uri, eventually, sim, spawn_broker, wait_for};
use tessera_broker::BrokerConfig;
use tessera_client::{ClientEvent, FailoverClient};
use tessera_core::{connector::ConnectorConfig, failover::TransportEvent};
use tessera_harness::{RecordingDispatch, SimEnv, sim_registry};
use tessera_proto::payloads::message::Message;

fn plain(host: &str) -> BrokerConfig {
    BrokerConfig::new(host).with_connector(ConnectorConfig::new("openwire", broker_uri(host, "")))
}

#[test]
fn buffered_messages_follow_the_client_to_a_surviving_broker() {
    let mut sim = sim(7, Duration::from_secs(60));
    let recorders: Vec<(&str, RecordingDispatch)> = ["broker-a", "broker-b", "broker-c"]
        .into_iter()
        .map(|host| (host, RecordingDispatch::new()))
        .collect();
    for (host, recorder) in &recorders {
        spawn_broker(&mut sim, host, plain(host), recorder.clone(), Duration::ZERO);
    }

    let crash = Arc::new(AtomicBool::new(false));
    let crash_requested = Arc::clone(&crash);
    let observed = recorders.clone();
    sim.client("client", async move {
        let uri = format!(
            "failover:({},{},{})?randomize=false&initialReconnectDelay=100&connectTimeout=1000\
             &wireFormat.maxInactivityDuration=1000",
            broker_uri("broker-a", ""),
            broker_uri("broker-b", ""),
            broker_uri("broker-c", ""),
        );
        let (client, mut events) = FailoverClient::connect(&uri, SimEnv::new(), sim_registry())?;
        let connected = wait_for(&mut events, Duration::from_secs(5), |event| {
            matches!(event, ClientEvent::Transport(TransportEvent::Connected { .. }))
        })
        .await;
        assert!(
            matches!(&connected, ClientEvent::Transport(TransportEvent::Connected { uri }) if uri.host() == "broker-a"),
            "{connected:?}"
        );

        client.send_message(Message::new("m-1", "orders", b"one".to_vec()))?;
        let first = &observed[0].1;
        eventually("m-1 at broker-a", Duration::from_secs(2), || first.message_ids() == ["m-1"]).await;

        crash_requested.store(true, Ordering::SeqCst);
        wait_for(&mut events, Duration::from_secs(5), |event| {
            matches!(event, ClientEvent::Transport(TransportEvent::Interrupted { .. }))
        })
        .await;

        client.send_message(Message::new("m-2", "orders", b"two".to_vec()))?;
        client.send_message(Message::new("m-3", "orders", b"three".to_vec()))?;

        let resumed = wait_for(&mut events, Duration::from_secs(10), |event| {
            matches!(event, ClientEvent::Transport(TransportEvent::Resumed { .. }))
        })
        .await;
        let ClientEvent::Transport(TransportEvent::Resumed { uri }) = resumed else {
            unreachable!("matched above");
        };
        assert_ne!(uri.host(), "broker-a");

        let (_, survivor) = observed
            .iter()
            .find(|(host, _)| *host == uri.host())
            .expect("resumed on a known broker");
        eventually("replayed messages", Duration::from_secs(2), || survivor.message_ids() == ["m-2", "m-3"])
            .await;
        assert_eq!(client.status().await?.buffered, 0);

        client.close().await?;
        Ok(())
    });

    let mut crashed = false;
    while !sim.step().expect("simulation failed") {
        if !crashed && crash.load(Ordering::SeqCst) {
            sim.crash("broker-a");
            crashed = true;
        }
    }
    assert!(crashed);
}

#[test]
fn unreachable_first_candidate_is_skipped() {
    let mut sim = sim(8, Duration::from_secs(30));
    let recorder = RecordingDispatch::new();
    spawn_broker(&mut sim, "broker-b", plain("broker-b"), recorder.clone(), Duration::ZERO);
    // broker-a exists on the network but never listens
    sim.host("broker-a", || std::future::pending::<turmoil::Result>());

    let observed = recorder.clone();
    sim.client("client", async move {
        let uri = format!(
            "failover:({},{})?randomize=false&initialReconnectDelay=100&connectTimeout=1000",
            broker_uri("broker-a", ""),
            broker_uri("broker-b", ""),
        );
        let (client, mut events) = FailoverClient::connect(&uri, SimEnv::new(), sim_registry())?;
        let connected = wait_for(&mut events, Duration::from_secs(5), |event| {
            matches!(event, ClientEvent::Transport(TransportEvent::Connected { .. }))
        })
        .await;
        assert!(
            matches!(&connected, ClientEvent::Transport(TransportEvent::Connected { uri }) if uri.host() == "broker-b"),
            "{connected:?}"
        );
        eventually("client registered", Duration::from_secs(1), || observed.active().len() == 1).await;

        client.close().await?;
        Ok(())
    });

    sim.run().expect("simulation failed");
}

#[test]
fn ordered_delivery_survives_packet_loss() {
    // TCP retransmits; 2% loss degrades the link without breaking it
    let mut sim = turmoil::Builder::new()
        .simulation_duration(Duration::from_secs(60))
        .fail_rate(0.02)
        .rng_seed(12345)
        .build();
    let recorder = RecordingDispatch::new();
    spawn_broker(&mut sim, "broker-a", plain("broker-a"), recorder.clone(), Duration::ZERO);

    let observed = recorder.clone();
    sim.client("client", async move {
        let uri = format!("failover:({})?initialReconnectDelay=100", broker_uri("broker-a", ""));
        let (client, mut events) = FailoverClient::connect(&uri, SimEnv::with_seed(12345), sim_registry())?;
        wait_for(&mut events, Duration::from_secs(10), |event| {
            matches!(event, ClientEvent::Transport(TransportEvent::Connected { .. }))
        })
        .await;

        let expected: Vec<String> = (0..50).map(|i| format!("m-{i}")).collect();
        for id in &expected {
            client.send_message(Message::new(id.clone(), "orders", Vec::new()))?;
        }
        eventually("all messages", Duration::from_secs(30), || observed.message_ids().len() >= expected.len())
            .await;
        assert_eq!(observed.message_ids(), expected);

        client.close().await?;
        Ok(())
    });

    sim.run().expect("simulation failed");
}
