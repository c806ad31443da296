//! Integration tests for heartbeat-driven liveness: keepalive under
//! shortened intervals and eviction of silent workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use zeromq::prelude::*;
use zeromq::DealerSocket;

use drehscheibe::protocol::{dealer_frames, WorkerMessage};
use drehscheibe::{
    Broker, BrokerSettings, DrehscheibeError, RequestHandler, Transport, Worker, WorkerSettings,
};

const SETTLE: Duration = Duration::from_millis(300);

struct NullHandler;

#[async_trait]
impl RequestHandler for NullHandler {
    async fn handle(&self, request: &[u8]) -> Result<Vec<u8>, DrehscheibeError> {
        Ok(request.to_vec())
    }
}

#[tokio::test]
async fn heartbeating_worker_stays_registered() {
    let transport = Transport::tcp("127.0.0.1", 17200);
    let broker = Broker::new(BrokerSettings {
        endpoint: transport.endpoint(),
        heartbeat_ms: 150,
        liveness_budget: 3,
        grace_secs: 0,
        ..BrokerSettings::default()
    });
    broker.start().await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let worker = Worker::builder("steady", transport.clone())
        .handler(Arc::new(NullHandler))
        .settings(WorkerSettings {
            heartbeat_ms: 150,
            ..WorkerSettings::default()
        })
        .build();
    worker.start().await.unwrap();

    // Several expiry windows pass; heartbeats must keep the record fresh.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let workers = broker.workers().await;
    assert_eq!(workers.len(), 1, "worker should still be registered");
    assert_eq!(workers[0].service, "steady");
    assert!(broker.stats().heartbeats > 0);

    worker.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn silent_worker_is_evicted_after_expiry_plus_grace() {
    let transport = Transport::tcp("127.0.0.1", 17210);
    let broker = Broker::new(BrokerSettings {
        endpoint: transport.endpoint(),
        heartbeat_ms: 100,
        liveness_budget: 2,
        grace_secs: 0,
        ..BrokerSettings::default()
    });
    broker.start().await.unwrap();
    tokio::time::sleep(SETTLE).await;

    // A raw dealer registers and then never heartbeats.
    let mut ghost = DealerSocket::new();
    ghost.connect(&transport.endpoint()).await.unwrap();
    let ready = serde_json::to_vec(&WorkerMessage::ready("ghost")).unwrap();
    ghost.send(dealer_frames(ready, None)).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    assert_eq!(broker.workers().await.len(), 1, "ghost should register");

    // Expiry window (200 ms) plus sweep cadence elapse with no heartbeat.
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(
        broker.workers().await.is_empty(),
        "silent worker should be evicted"
    );
    for service in broker.services().await {
        assert_eq!(service.waiting, 0, "waiting queue should be cleared");
    }
    assert_eq!(broker.stats().workers_evicted, 1);

    broker.stop().await;
}

#[tokio::test]
async fn worker_reregisters_after_broker_restart() {
    let transport = Transport::tcp("127.0.0.1", 17230);
    let first = Broker::new(BrokerSettings {
        endpoint: transport.endpoint(),
        ..BrokerSettings::default()
    });
    first.start().await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let worker = Worker::builder("phoenix", transport.clone())
        .handler(Arc::new(NullHandler))
        .settings(WorkerSettings {
            heartbeat_ms: 150,
            reconnect_base_secs: 1,
            reconnect_max_secs: 2,
            ..WorkerSettings::default()
        })
        .build();
    worker.start().await.unwrap();
    tokio::time::sleep(SETTLE).await;
    assert_eq!(first.workers().await.len(), 1);

    // Kill the broker out from under the worker.
    first.stop().await;
    tokio::time::sleep(SETTLE).await;

    let second = Broker::new(BrokerSettings {
        endpoint: transport.endpoint(),
        ..BrokerSettings::default()
    });
    second.start().await.unwrap();

    // The worker detects the dead link via its heartbeat, backs off, and
    // re-sends READY to the new broker.
    let mut registered = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let workers = second.workers().await;
        if workers.iter().any(|w| w.service == "phoenix") {
            registered = true;
            break;
        }
    }
    assert!(registered, "worker should re-register with the new broker");

    worker.stop().await;
    second.stop().await;
}

#[tokio::test]
async fn disconnect_removes_worker_immediately() {
    let transport = Transport::tcp("127.0.0.1", 17220);
    let broker = Broker::new(BrokerSettings {
        endpoint: transport.endpoint(),
        ..BrokerSettings::default()
    });
    broker.start().await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let worker = Worker::builder("fleeting", transport.clone())
        .handler(Arc::new(NullHandler))
        .build();
    worker.start().await.unwrap();
    tokio::time::sleep(SETTLE).await;
    assert_eq!(broker.workers().await.len(), 1);

    worker.stop().await;
    tokio::time::sleep(SETTLE).await;

    assert!(
        broker.workers().await.is_empty(),
        "DISCONNECT should remove the worker without waiting for the sweep"
    );

    broker.stop().await;
}
