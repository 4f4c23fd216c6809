//! Negotiation and inactivity detection over the simulated network.

mod common;

use std::time::Duration;

use common::{broker_uri, clustered, eventually, sim, spawn_broker, wait_for};
use tessera_broker::BrokerConfig;
use tessera_client::{ClientEvent, FailoverClient};
use tessera_core::{TransportError, connector::ConnectorConfig, failover::TransportEvent};
use tessera_harness::{RecordingDispatch, SimEnv, sim_registry};

#[test]
fn both_sides_settle_on_the_shorter_inactivity() {
    let mut sim = sim(1, Duration::from_secs(30));
    let recorder = RecordingDispatch::new();
    let config = BrokerConfig::new("a").with_connector(clustered("broker-a", "wireFormat.maxInactivityDuration=5000"));
    spawn_broker(&mut sim, "broker-a", config, recorder.clone(), Duration::ZERO);

    let observed = recorder.clone();
    sim.client("client", async move {
        let uri = format!(
            "failover:({})?wireFormat.maxInactivityDuration=2000&wireFormat.cacheEnabled=false",
            broker_uri("broker-a", "")
        );
        let (client, mut events) = FailoverClient::connect(&uri, SimEnv::new(), sim_registry())?;
        wait_for(&mut events, Duration::from_secs(5), |event| {
            matches!(event, ClientEvent::Transport(TransportEvent::Connected { .. }))
        })
        .await;

        let negotiated = client.status().await?.negotiated.expect("negotiated");
        assert_eq!(negotiated.max_inactivity, Duration::from_secs(2));
        assert!(!negotiated.cache_enabled);

        eventually("broker side established", Duration::from_secs(1), || !observed.negotiated().is_empty())
            .await;
        assert_eq!(observed.negotiated(), vec![negotiated]);

        // idle well past the interval: keep-alives hold the connection
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(observed.active().len(), 1);
        assert!(observed.lost_reasons().is_empty());

        client.close().await?;
        Ok(())
    });

    sim.run().expect("simulation failed");
}

#[test]
fn partitioned_peers_detect_silence_and_recover() {
    let mut sim = sim(2, Duration::from_secs(60));
    let recorder = RecordingDispatch::new();
    let config = BrokerConfig::new("a").with_connector(ConnectorConfig::new(
        "openwire",
        broker_uri("broker-a", "wireFormat.maxInactivityDuration=1000"),
    ));
    spawn_broker(&mut sim, "broker-a", config, recorder.clone(), Duration::ZERO);

    let observed = recorder.clone();
    sim.client("client", async move {
        let uri = format!("failover:({})?initialReconnectDelay=100", broker_uri("broker-a", ""));
        let (client, mut events) = FailoverClient::connect(&uri, SimEnv::new(), sim_registry())?;
        wait_for(&mut events, Duration::from_secs(5), |event| {
            matches!(event, ClientEvent::Transport(TransportEvent::Connected { .. }))
        })
        .await;

        turmoil::partition("client", "broker-a");
        let started = tokio::time::Instant::now();
        let event = wait_for(&mut events, Duration::from_secs(5), |event| {
            matches!(event, ClientEvent::Transport(TransportEvent::Interrupted { .. }))
        })
        .await;
        let detected = started.elapsed();
        assert!(detected <= Duration::from_millis(1500), "client detected after {detected:?}");
        match event {
            ClientEvent::Transport(TransportEvent::Interrupted { reason }) => {
                assert!(reason.contains("inactive"), "{reason}");
            },
            other => panic!("unexpected {other:?}"),
        }

        eventually("broker drops the silent client", Duration::from_secs(2), || {
            observed
                .lost_reasons()
                .iter()
                .any(|reason| matches!(reason, TransportError::ConnectionInactive { .. }))
        })
        .await;
        assert!(observed.active().is_empty());

        turmoil::repair("client", "broker-a");
        wait_for(&mut events, Duration::from_secs(15), |event| {
            matches!(event, ClientEvent::Transport(TransportEvent::Resumed { .. }))
        })
        .await;
        eventually("reconnected client registered", Duration::from_secs(1), || observed.active().len() == 1)
            .await;

        client.close().await?;
        Ok(())
    });

    sim.run().expect("simulation failed");
}
