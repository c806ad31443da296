//! Integration tests for broker routing: request/reply round trips,
//! queued dispatch, direct routing, and the device-list handshake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::timeout;

use drehscheibe::{
    Broker, BrokerSettings, Client, ClientSettings, DeviceListHook, DrehscheibeError,
    RequestHandler, ServiceRequest, ServiceResponse, Transport, Worker, HUB_CONTROL_SERVICE,
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

/// Returns the request payload unchanged.
struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, request: &[u8]) -> Result<Vec<u8>, DrehscheibeError> {
        let req: ServiceRequest = serde_json::from_slice(request)?;
        Ok(serde_json::to_vec(&req.payload)?)
    }
}

/// Uppercases string payloads.
struct UppercaseHandler;

#[async_trait]
impl RequestHandler for UppercaseHandler {
    async fn handle(&self, request: &[u8]) -> Result<Vec<u8>, DrehscheibeError> {
        let req: ServiceRequest = serde_json::from_slice(request)?;
        let text = req.payload.as_str().unwrap_or_default().to_uppercase();
        Ok(serde_json::to_vec(&json!(text))?)
    }
}

#[tokio::test]
async fn request_reply_roundtrip() {
    let transport = Transport::tcp("127.0.0.1", 17100);
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

    let response = timeout(TIMEOUT, client.request("echo", "echo", json!("hello")))
        .await
        .expect("request timed out")
        .unwrap();
    assert!(response.success);
    assert_eq!(response.service, "echo");
    assert_eq!(response.data, Some(json!("hello")));

    let stats = broker.stats();
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.responses, 1);
    assert!(stats.responses <= stats.requests + stats.synthesized_errors);

    client.stop().await;
    worker.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn queued_request_dispatched_when_worker_arrives() {
    let transport = Transport::tcp("127.0.0.1", 17110);
    let broker = start_broker(&transport).await;

    // Seed the service record: a worker registers and leaves. The service
    // persists for the broker's lifetime with an empty waiting queue.
    let seed = Worker::builder("slow", transport.clone()).build();
    seed.start().await.unwrap();
    tokio::time::sleep(SETTLE).await;
    seed.stop().await;
    tokio::time::sleep(SETTLE).await;

    let client = Client::connect(&transport, ClientSettings::default())
        .await
        .unwrap();
    tokio::time::sleep(SETTLE).await;

    // Issue the request while no worker is connected; it must queue.
    let requester = client.clone();
    let in_flight =
        tokio::spawn(async move { requester.request("slow", "work", json!("x")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let services = broker.services().await;
    let slow = services.iter().find(|s| s.name == "slow").unwrap();
    assert_eq!(slow.pending, 1, "request should be parked in the queue");

    // A worker arriving drains the queue.
    let worker = Worker::builder("slow", transport.clone())
        .handler(Arc::new(UppercaseHandler))
        .build();
    worker.start().await.unwrap();

    let response = timeout(TIMEOUT, in_flight)
        .await
        .expect("queued request never completed")
        .unwrap()
        .unwrap();
    assert!(response.success);
    assert_eq!(response.data, Some(json!("X")));

    client.stop().await;
    worker.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn unknown_service_yields_error_response() {
    let transport = Transport::tcp("127.0.0.1", 17120);
    let broker = start_broker(&transport).await;

    let client = Client::connect(&transport, ClientSettings::default())
        .await
        .unwrap();
    tokio::time::sleep(SETTLE).await;

    let err = timeout(
        TIMEOUT,
        client.request("nonexistent", "anything", json!({})),
    )
    .await
    .expect("error should come back promptly")
    .unwrap_err();

    match err {
        DrehscheibeError::Service(msg) => {
            assert!(msg.contains("service not available: nonexistent"), "got: {msg}")
        }
        other => panic!("expected service error, got: {other}"),
    }
    assert_eq!(broker.stats().synthesized_errors, 1);

    client.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn hub_request_without_worker_is_not_queued() {
    let transport = Transport::tcp("127.0.0.1", 17130);
    let broker = start_broker(&transport).await;

    let client = Client::connect(&transport, ClientSettings::default())
        .await
        .unwrap();
    tokio::time::sleep(SETTLE).await;

    let err = timeout(
        TIMEOUT,
        client.request(HUB_CONTROL_SERVICE, "power", json!({"device": "tv"})),
    )
    .await
    .expect("error should come back promptly")
    .unwrap_err();

    match err {
        DrehscheibeError::Service(msg) => {
            assert!(msg.contains("hub worker not available"), "got: {msg}")
        }
        other => panic!("expected service error, got: {other}"),
    }

    // Nothing queued for the hub service.
    for service in broker.services().await {
        assert_eq!(service.pending, 0);
    }

    client.stop().await;
    broker.stop().await;
}

/// Hub worker that answers the device-list handshake with a complete
/// response, exercising the verbatim pass-through path.
struct HubHandler;

#[async_trait]
impl RequestHandler for HubHandler {
    async fn handle(&self, request: &[u8]) -> Result<Vec<u8>, DrehscheibeError> {
        let req: ServiceRequest = serde_json::from_slice(request)?;
        let response = ServiceResponse {
            message_id: req.message_id,
            service: HUB_CONTROL_SERVICE.into(),
            success: true,
            data: Some(json!({
                "devices": [{"id": "tv-1", "kind": "tv"}],
                "hub_id": "hub-7",
            })),
            error: None,
            nonce: req.nonce,
        };
        Ok(serde_json::to_vec(&response)?)
    }
}

struct CaptureHook {
    tx: tokio::sync::Mutex<Option<tokio::sync::oneshot::Sender<ServiceResponse>>>,
}

#[async_trait]
impl DeviceListHook for CaptureHook {
    async fn on_device_list(&self, response: ServiceResponse) {
        if let Some(tx) = self.tx.lock().await.take() {
            let _ = tx.send(response);
        }
    }
}

#[tokio::test]
async fn hub_registration_triggers_device_list_handshake() {
    let transport = Transport::tcp("127.0.0.1", 17140);
    let broker = start_broker(&transport).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    broker.set_device_list_hook(Arc::new(CaptureHook {
        tx: tokio::sync::Mutex::new(Some(tx)),
    }));

    // Registering the hub worker is the only trigger; no client involved.
    let worker = Worker::builder(HUB_CONTROL_SERVICE, transport.clone())
        .handler(Arc::new(HubHandler))
        .build();
    worker.start().await.unwrap();

    let response = timeout(TIMEOUT, rx)
        .await
        .expect("hook never fired")
        .unwrap();
    assert!(response.success);
    let data = response.data.unwrap();
    assert_eq!(data["hub_id"], json!("hub-7"));
    assert_eq!(data["devices"][0]["id"], json!("tv-1"));

    let workers = broker.workers().await;
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].service, HUB_CONTROL_SERVICE);

    worker.stop().await;
    broker.stop().await;
}
