//! Closing a client while it is backing off between reconnect rounds.

mod common;

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{broker_uri, sim, wait_for};
use tessera_client::{ClientEvent, FailoverClient};
use tessera_core::{
    failover::TransportEvent,
    transport::{Transport, TransportListener, TransportRegistry, TransportStream},
    uri::BrokerUri,
};
use tessera_harness::{SimEnv, SimTransport};
use tessera_proto::payloads::message::Message;

/// Counts connect attempts before delegating to the simulated network.
#[derive(Debug, Default)]
struct CountingTransport {
    connects: AtomicUsize,
}

#[async_trait]
impl Transport for CountingTransport {
    async fn connect(&self, uri: &BrokerUri) -> io::Result<TransportStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        SimTransport.connect(uri).await
    }

    async fn bind(&self, uri: &BrokerUri) -> io::Result<Box<dyn TransportListener>> {
        SimTransport.bind(uri).await
    }
}

#[test]
fn close_during_backoff_stops_all_connects() {
    let mut sim = sim(31, Duration::from_secs(60));
    for host in ["broker-a", "broker-b"] {
        sim.host(host, || std::future::pending::<turmoil::Result>());
    }

    sim.client("client", async move {
        let counter = Arc::new(CountingTransport::default());
        let registry = TransportRegistry::new().with("tcp", Arc::clone(&counter) as Arc<dyn Transport>);
        let uri = format!(
            "failover:({},{})?randomize=false&initialReconnectDelay=2000&useExponentialBackOff=false",
            broker_uri("broker-a", ""),
            broker_uri("broker-b", ""),
        );
        let (client, mut events) = FailoverClient::connect(&uri, SimEnv::new(), registry)?;

        let exhausted = wait_for(&mut events, Duration::from_secs(10), |event| {
            matches!(event, ClientEvent::Transport(TransportEvent::Exhausted { .. }))
        })
        .await;
        assert!(
            matches!(exhausted, ClientEvent::Transport(TransportEvent::Exhausted { attempts: 2, .. })),
            "{exhausted:?}"
        );

        client.send_message(Message::new("m-1", "orders", b"late".to_vec()))?;
        assert_eq!(client.status().await?.buffered, 1);

        let attempted = counter.connects.load(Ordering::SeqCst);
        assert_eq!(client.close().await?, 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.connects.load(Ordering::SeqCst), attempted);

        let closed = wait_for(&mut events, Duration::from_secs(1), |event| {
            matches!(event, ClientEvent::Transport(TransportEvent::Closed { .. }))
        })
        .await;
        assert_eq!(closed, ClientEvent::Transport(TransportEvent::Closed { undelivered: 1 }));
        Ok(())
    });

    sim.run().expect("simulation failed");
}
