//! Integration tests for client correlation: timeouts, async callbacks,
//! and fire-and-forget with nonce matching.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::timeout;

use drehscheibe::{
    Broker, BrokerSettings, Client, ClientSettings, DrehscheibeError, RequestHandler,
    ServiceRequest, Transport, Worker,
};

const SETTLE: Duration = Duration::from_millis(300);
const TIMEOUT: Duration = Duration::from_secs(5);

async fn start_broker(transport: &Transport) -> Broker {
    let broker = Broker::new(BrokerSettings {
        endpoint: transport.endpoint(),
        ..BrokerSettings::default()
    });
    broker.start().await.unwrap();
    tokio::time::sleep(SETTLE).await;
    broker
}

struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, request: &[u8]) -> Result<Vec<u8>, DrehscheibeError> {
        let req: ServiceRequest = serde_json::from_slice(request)?;
        Ok(serde_json::to_vec(&req.payload)?)
    }
}

#[tokio::test]
async fn request_times_out_when_no_worker_serves_the_queue() {
    let transport = Transport::tcp("127.0.0.1", 17300);
    let broker = start_broker(&transport).await;

    // Create the service record, then leave its queue unserved.
    let seed = Worker::builder("void", transport.clone()).build();
    seed.start().await.unwrap();
    tokio::time::sleep(SETTLE).await;
    seed.stop().await;
    tokio::time::sleep(SETTLE).await;

    let client = Client::connect(
        &transport,
        ClientSettings {
            retries: 0,
            ..ClientSettings::default()
        },
    )
    .await
    .unwrap();
    tokio::time::sleep(SETTLE).await;

    let started = std::time::Instant::now();
    let err = client
        .request_with_timeout("void", "work", json!(1), Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(err, DrehscheibeError::Timeout));
    // Resolved close to the requested deadline, not the default 30 s.
    assert!(started.elapsed() < Duration::from_secs(2));

    let stats = client.stats();
    assert_eq!(stats.requests_sent, 1);
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.responses_received, 0);

    client.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn async_request_invokes_callback_with_reply() {
    let transport = Transport::tcp("127.0.0.1", 17310);
    let broker = start_broker(&transport).await;

    let worker = Worker::builder("echo", transport.clone())
        .handler(Arc::new(EchoHandler))
        .build();
    worker.start().await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let client = Client::connect(&transport, ClientSettings::default())
        .await
        .unwrap();
    tokio::time::sleep(SETTLE).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    client.request_async("echo", "echo", json!({"k": "v"}), move |result| {
        let _ = tx.send(result);
    });

    let result = timeout(TIMEOUT, rx)
        .await
        .expect("callback never fired")
        .unwrap();
    let response = result.unwrap();
    assert!(response.success);
    assert_eq!(response.data, Some(json!({"k": "v"})));

    client.stop().await;
    worker.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn fire_and_forget_reply_is_counted_not_warned() {
    let transport = Transport::tcp("127.0.0.1", 17320);
    let broker = start_broker(&transport).await;

    let worker = Worker::builder("notify", transport.clone())
        .handler(Arc::new(EchoHandler))
        .build();
    worker.start().await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let client = Client::connect(&transport, ClientSettings::default())
        .await
        .unwrap();
    tokio::time::sleep(SETTLE).await;

    client
        .request_fire_and_forget("notify", "ping", json!("n"), Some("n1".into()))
        .await
        .unwrap();

    // The worker's reply carries the nonce back; give it time to land.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let stats = client.stats();
    assert_eq!(stats.requests_sent, 1);
    assert_eq!(stats.responses_received, 1);
    assert_eq!(stats.timeouts, 0);

    client.stop().await;
    worker.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn service_failure_reaches_the_error_sink() {
    struct FailingHandler;

    #[async_trait]
    impl RequestHandler for FailingHandler {
        async fn handle(&self, _request: &[u8]) -> Result<Vec<u8>, DrehscheibeError> {
            Err(DrehscheibeError::Service("device unreachable".into()))
        }
    }

    let transport = Transport::tcp("127.0.0.1", 17330);
    let broker = start_broker(&transport).await;

    let worker = Worker::builder("flaky", transport.clone())
        .handler(Arc::new(FailingHandler))
        .build();
    worker.start().await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let client = Client::connect(&transport, ClientSettings::default())
        .await
        .unwrap();
    tokio::time::sleep(SETTLE).await;

    let err = timeout(TIMEOUT, client.request("flaky", "work", json!(1)))
        .await
        .expect("reply should arrive")
        .unwrap_err();
    match err {
        DrehscheibeError::Service(msg) => {
            assert!(msg.contains("device unreachable"), "got: {msg}")
        }
        other => panic!("expected service error, got: {other}"),
    }
    assert_eq!(client.stats().failures, 1);

    client.stop().await;
    worker.stop().await;
    broker.stop().await;
}
