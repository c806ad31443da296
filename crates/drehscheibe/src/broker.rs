//! Central broker: binds a ROUTER socket, classifies peers by protocol
//! header, routes client requests to service workers, and evicts dead
//! workers.
//!
//! The broker runs as a set of cooperating tasks connected by bounded
//! channels:
//!
//! | task | input | output |
//! |---|---|---|
//! | socket loop | router socket / send channel | raw-frame channel |
//! | classifier | raw-frame channel | worker-event / client-event channels |
//! | worker events | worker-event channel | registry mutations, sends |
//! | client events | client-event channel | registry mutations, sends |
//! | liveness sweep | ticker | evictions |
//! | fault handler | fault channel | logs, drop counters |
//!
//! When a bounded channel is full the producer drops the frame with a
//! warning; clients re-issue or time out, so drops are recoverable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};
use zeromq::prelude::*;
use zeromq::{RouterSocket, ZmqMessage};

use crate::config::BrokerSettings;
use crate::error::DrehscheibeError;
use crate::metrics::{BrokerStats, BrokerStatsSnapshot};
use crate::protocol::{
    classify, generate_message_id, ident, parse_router_frames, router_frames, ClientMessage,
    Envelope, ServiceRequest, ServiceResponse, WorkerCommand, WorkerMessage, DEVICE_LIST_ACTION,
    GATEWAY_CLIENT_ID, HUB_CONTROL_SERVICE,
};
use crate::registry::{PendingRequest, Registry, ServiceSnapshot, WorkerSnapshot};
use crate::traits::DeviceListHook;

// ── Internal events ──────────────────────────────────────────────────

struct WorkerEvent {
    identity: Vec<u8>,
    message: WorkerMessage,
    overflow: Option<Vec<u8>>,
}

struct ClientEvent {
    identity: Vec<u8>,
    message: ClientMessage,
    overflow: Option<Vec<u8>>,
}

/// Faults surfaced by broker tasks onto the error channel.
enum Fault {
    Malformed(DrehscheibeError),
    Send {
        context: &'static str,
        error: DrehscheibeError,
    },
}

/// Shared state handed to every broker task.
#[derive(Clone)]
struct BrokerCtx {
    settings: BrokerSettings,
    registry: Arc<RwLock<Registry>>,
    stats: Arc<BrokerStats>,
    hook: Arc<std::sync::RwLock<Option<Arc<dyn DeviceListHook>>>>,
    send_tx: mpsc::Sender<ZmqMessage>,
    fault_tx: mpsc::Sender<Fault>,
}

// ── Broker ───────────────────────────────────────────────────────────

/// Service-oriented message broker over a ROUTER socket.
pub struct Broker {
    settings: BrokerSettings,
    registry: Arc<RwLock<Registry>>,
    stats: Arc<BrokerStats>,
    hook: Arc<std::sync::RwLock<Option<Arc<dyn DeviceListHook>>>>,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    started: AtomicBool,
}

impl Broker {
    /// Create an unstarted broker with the given settings.
    pub fn new(settings: BrokerSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            settings,
            registry: Arc::new(RwLock::new(Registry::new())),
            stats: Arc::new(BrokerStats::default()),
            hook: Arc::new(std::sync::RwLock::new(None)),
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Register the upcall for hub device-list replies. May be set before or
    /// after [`start`](Self::start); unset means such replies are discarded.
    pub fn set_device_list_hook(&self, hook: Arc<dyn DeviceListHook>) {
        *self.hook.write().expect("hook lock poisoned") = Some(hook);
    }

    /// Bind the router socket and spawn the internal tasks.
    ///
    /// Returns once the endpoint is bound; fails with the bind error
    /// otherwise. A broker starts at most once.
    pub async fn start(&self) -> Result<(), DrehscheibeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DrehscheibeError::Transport("broker already started".into()));
        }

        let endpoint = self.settings.transport().endpoint();
        let mut socket = RouterSocket::new();
        socket.bind(&endpoint).await?;
        if self.settings.curve.is_some() {
            debug!("curve key material supplied to socket layer");
        }
        info!(endpoint = %endpoint, "broker router socket bound");

        let cap = self.settings.channel_capacity;
        let (send_tx, send_rx) = mpsc::channel::<ZmqMessage>(cap);
        let (raw_tx, raw_rx) = mpsc::channel::<ZmqMessage>(cap);
        let (worker_tx, worker_rx) = mpsc::channel::<WorkerEvent>(cap);
        let (client_tx, client_rx) = mpsc::channel::<ClientEvent>(cap);
        let (fault_tx, fault_rx) = mpsc::channel::<Fault>(cap);

        let ctx = BrokerCtx {
            settings: self.settings.clone(),
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&self.stats),
            hook: Arc::clone(&self.hook),
            send_tx,
            fault_tx,
        };

        let mut tasks = self.tasks.lock().expect("task list poisoned");
        tasks.push(tokio::spawn(socket_loop(
            socket,
            send_rx,
            raw_tx,
            ctx.clone(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(classify_loop(
            raw_rx,
            worker_tx,
            client_tx,
            ctx.clone(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(worker_event_loop(
            worker_rx,
            ctx.clone(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(client_event_loop(
            client_rx,
            ctx.clone(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(sweep_loop(
            ctx.clone(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(fault_loop(
            fault_rx,
            ctx,
            self.shutdown.subscribe(),
        )));
        Ok(())
    }

    /// Signal shutdown and wait for every internal task to exit. The socket
    /// closes when its task drops it.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().expect("task list poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("broker stopped");
    }

    /// Counter snapshot; never blocks producers.
    pub fn stats(&self) -> BrokerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Current services with queue depths.
    pub async fn services(&self) -> Vec<ServiceSnapshot> {
        self.registry.read().await.service_snapshots()
    }

    /// Current workers with liveness deadlines.
    pub async fn workers(&self) -> Vec<WorkerSnapshot> {
        self.registry.read().await.worker_snapshots()
    }
}

// ── Socket loop ──────────────────────────────────────────────────────

/// Owns the router socket: multiplexes outbound sends (linearized through
/// the send channel) with inbound receives.
async fn socket_loop(
    mut socket: RouterSocket,
    mut send_rx: mpsc::Receiver<ZmqMessage>,
    raw_tx: mpsc::Sender<ZmqMessage>,
    ctx: BrokerCtx,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(frame) = send_rx.recv() => {
                let sent = tokio::time::timeout(Duration::from_secs(5), socket.send(frame)).await;
                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        let _ = ctx.fault_tx.try_send(Fault::Send {
                            context: "router send",
                            error: e.into(),
                        });
                    }
                    Err(_) => {
                        let _ = ctx.fault_tx.try_send(Fault::Send {
                            context: "router send",
                            error: DrehscheibeError::Transport("send stalled".into()),
                        });
                    }
                }
            }
            result = socket.recv() => match result {
                Ok(msg) => {
                    if raw_tx.try_send(msg).is_err() {
                        BrokerStats::incr(&ctx.stats.dropped);
                        warn!("inbound channel full, dropping frame");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "router recv error, backing off");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
    info!("broker socket loop stopped");
}

// ── Classifier ───────────────────────────────────────────────────────

/// Parses raw frames and fans them out by protocol header. Malformed frames
/// go to the fault channel and never stop the loop.
async fn classify_loop(
    mut raw_rx: mpsc::Receiver<ZmqMessage>,
    worker_tx: mpsc::Sender<WorkerEvent>,
    client_tx: mpsc::Sender<ClientEvent>,
    ctx: BrokerCtx,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.changed() => break,
            msg = raw_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let (identity, envelope, overflow) = match parse_router_frames(&msg) {
            Ok(parts) => parts,
            Err(e) => {
                let _ = ctx.fault_tx.try_send(Fault::Malformed(e));
                continue;
            }
        };

        match classify(&envelope) {
            Ok(Envelope::Worker(message)) => {
                if worker_tx
                    .try_send(WorkerEvent {
                        identity,
                        message,
                        overflow,
                    })
                    .is_err()
                {
                    BrokerStats::incr(&ctx.stats.dropped);
                    warn!("worker-event channel full, dropping frame");
                }
            }
            Ok(Envelope::Client(message)) => {
                if client_tx
                    .try_send(ClientEvent {
                        identity,
                        message,
                        overflow,
                    })
                    .is_err()
                {
                    BrokerStats::incr(&ctx.stats.dropped);
                    warn!("client-event channel full, dropping frame");
                }
            }
            Err(e) => {
                let _ = ctx.fault_tx.try_send(Fault::Malformed(e));
            }
        }
    }
}

// ── Worker events ────────────────────────────────────────────────────

async fn worker_event_loop(
    mut worker_rx: mpsc::Receiver<WorkerEvent>,
    ctx: BrokerCtx,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            ev = worker_rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };

        match event.message.command {
            WorkerCommand::Ready => handle_ready(&ctx, event).await,
            WorkerCommand::Heartbeat => handle_heartbeat(&ctx, event).await,
            WorkerCommand::Reply => handle_reply(&ctx, event).await,
            WorkerCommand::Disconnect => handle_disconnect(&ctx, event).await,
            WorkerCommand::Request => {
                debug!("ignoring REQUEST command from a worker peer");
            }
        }
    }
}

async fn handle_ready(ctx: &BrokerCtx, event: WorkerEvent) {
    let id_hex = ident::encode(&event.identity);
    let service = event.message.service.clone().unwrap_or_default();

    {
        let mut registry = ctx.registry.write().await;
        registry.register_worker(
            &id_hex,
            event.identity.clone(),
            &service,
            ctx.settings.expiry_window(),
            ctx.settings.liveness_budget,
        );
    }
    BrokerStats::incr(&ctx.stats.workers_registered);
    info!(worker = %id_hex, service = %service, "worker registered");

    drain_pending(ctx, &service).await;

    // A hub registration triggers the device-list handshake: the broker asks
    // on behalf of the gateway before any client knows the hub exists.
    if service == HUB_CONTROL_SERVICE {
        let request = ServiceRequest {
            message_id: generate_message_id(),
            service: HUB_CONTROL_SERVICE.into(),
            action: DEVICE_LIST_ACTION.into(),
            payload: serde_json::json!({}),
            nonce: None,
            timeout: None,
        };
        let body = match serde_json::to_string(&request) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to serialize device-list request");
                return;
            }
        };
        info!(worker = %id_hex, "hub registered, requesting device list");
        send_worker_request(ctx, &event.identity, HUB_CONTROL_SERVICE, GATEWAY_CLIENT_ID, body, None)
            .await;
    }
}

async fn handle_heartbeat(ctx: &BrokerCtx, event: WorkerEvent) {
    let id_hex = ident::encode(&event.identity);
    let known = ctx.registry.write().await.refresh_worker(
        &id_hex,
        ctx.settings.expiry_window(),
        ctx.settings.liveness_budget,
    );

    if known {
        BrokerStats::incr(&ctx.stats.heartbeats);
        send_worker_command(ctx, &event.identity, WorkerMessage::heartbeat()).await;
    } else {
        debug!(worker = %id_hex, "heartbeat from unknown worker, requesting re-registration");
        send_worker_command(ctx, &event.identity, WorkerMessage::disconnect()).await;
    }
}

async fn handle_reply(ctx: &BrokerCtx, event: WorkerEvent) {
    let id_hex = ident::encode(&event.identity);
    let client_id = event.message.client_id.clone().unwrap_or_default();
    let body = event
        .message
        .effective_body(event.overflow.clone())
        .unwrap_or_default();

    let known = {
        let mut registry = ctx.registry.write().await;
        let known = registry.refresh_worker(
            &id_hex,
            ctx.settings.expiry_window(),
            ctx.settings.liveness_budget,
        );
        if known {
            registry.worker_ready(&id_hex);
        }
        known
    };
    if !known {
        // The client is still waiting for this body, so forward it anyway;
        // the DISCONNECT asks the stray worker to re-register.
        warn!(worker = %id_hex, "reply from unknown worker, requesting re-registration");
        send_worker_command(ctx, &event.identity, WorkerMessage::disconnect()).await;
    }

    // Parse a copy for routing metadata; the original body string is
    // forwarded untouched.
    let parsed: Option<ServiceResponse> = serde_json::from_str(&body).ok();
    let service = event
        .message
        .service
        .clone()
        .or_else(|| parsed.as_ref().map(|p| p.service.clone()))
        .unwrap_or_default();

    if client_id == GATEWAY_CLIENT_ID && service == HUB_CONTROL_SERVICE {
        if let Some(response) = parsed.as_ref().filter(|r| r.is_device_list()) {
            let hook = ctx.hook.read().expect("hook lock poisoned").clone();
            match hook {
                Some(hook) => {
                    debug!(worker = %id_hex, "delivering device list to hook");
                    hook.on_device_list(response.clone()).await;
                }
                None => debug!("device-list reply with no hook registered, discarding"),
            }
            drain_pending(ctx, &service).await;
            return;
        }
    }

    let target = {
        let registry = ctx.registry.read().await;
        registry.client_identity(&client_id).cloned()
    };
    let target = target.or_else(|| ident::decode(&client_id));

    match target {
        Some(client_identity) => {
            let message_id = parsed
                .as_ref()
                .map(|p| p.message_id.clone())
                .unwrap_or_default();
            send_client_reply(ctx, client_identity, &service, &message_id, body).await;
            BrokerStats::incr(&ctx.stats.responses);
        }
        None => {
            BrokerStats::incr(&ctx.stats.dropped);
            warn!(client = %client_id, "reply for unknown client dropped");
        }
    }

    drain_pending(ctx, &service).await;
}

async fn handle_disconnect(ctx: &BrokerCtx, event: WorkerEvent) {
    let id_hex = ident::encode(&event.identity);
    if let Some(record) = ctx.registry.write().await.remove_worker(&id_hex) {
        info!(worker = %id_hex, service = %record.service, "worker disconnected");
    }
}

// ── Client events ────────────────────────────────────────────────────

async fn client_event_loop(
    mut client_rx: mpsc::Receiver<ClientEvent>,
    ctx: BrokerCtx,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            ev = client_rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        handle_client_request(&ctx, event).await;
    }
}

async fn handle_client_request(ctx: &BrokerCtx, event: ClientEvent) {
    BrokerStats::incr(&ctx.stats.requests);
    let id_hex = ident::encode(&event.identity);
    let service = event.message.service.clone();
    // Forward the body where the client put it: envelope field or overflow
    // frame, never both.
    let body = event.message.body.clone();

    {
        let mut registry = ctx.registry.write().await;
        registry.record_client(&id_hex, event.identity.clone());
    }

    // Direct routing: the hub service never queues.
    if service == HUB_CONTROL_SERVICE {
        let worker = ctx.registry.write().await.first_ready(&service);
        match worker {
            Some(worker) => {
                send_worker_request(
                    ctx,
                    &worker.identity_bytes,
                    &service,
                    &id_hex,
                    body,
                    event.overflow,
                )
                .await;
            }
            None => {
                synthesize_error(ctx, &event, "hub worker not available").await;
            }
        }
        return;
    }

    if !ctx.registry.read().await.has_service(&service) {
        synthesize_error(ctx, &event, &format!("service not available: {service}")).await;
        return;
    }

    let dispatch = {
        let mut registry = ctx.registry.write().await;
        match registry.next_waiting(&service) {
            Some(worker) => Some(worker),
            None => {
                registry.enqueue_pending(PendingRequest {
                    client_identity: event.identity.clone(),
                    message_id: event.message.message_id.clone(),
                    service: service.clone(),
                    body: body.clone(),
                    overflow: event.overflow.clone(),
                    enqueued_at: std::time::Instant::now(),
                });
                None
            }
        }
    };

    match dispatch {
        Some(worker) => {
            send_worker_request(
                ctx,
                &worker.identity_bytes,
                &service,
                &id_hex,
                body,
                event.overflow,
            )
            .await;
        }
        None => {
            debug!(service = %service, "no waiting worker, request queued");
        }
    }
}

/// Fabricate an error ServiceResponse and send it straight back to the
/// requesting client, mirroring its correlation fields.
async fn synthesize_error(ctx: &BrokerCtx, event: &ClientEvent, error: &str) {
    let body = event.message.effective_body(event.overflow.clone());
    let nonce = serde_json::from_str::<ServiceRequest>(&body)
        .ok()
        .and_then(|r| r.nonce);

    let mut response = ServiceResponse::failure(&event.message.message_id, &event.message.service, error);
    response.nonce = nonce;

    let body = match serde_json::to_string(&response) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "failed to serialize synthesized error");
            return;
        }
    };
    warn!(
        service = %event.message.service,
        message_id = %event.message.message_id,
        error = %error,
        "synthesizing error response"
    );
    send_client_reply(
        ctx,
        event.identity.clone(),
        &event.message.service,
        &event.message.message_id,
        body,
    )
    .await;
    BrokerStats::incr(&ctx.stats.synthesized_errors);
}

// ── Dispatch helpers ─────────────────────────────────────────────────

/// Pair queued requests with waiting workers until either runs dry.
async fn drain_pending(ctx: &BrokerCtx, service: &str) {
    loop {
        let pair = {
            let mut registry = ctx.registry.write().await;
            match registry.pop_pending(service) {
                Some(request) => match registry.next_waiting(service) {
                    Some(worker) => Some((worker, request)),
                    None => {
                        registry.requeue_front(request);
                        None
                    }
                },
                None => None,
            }
        };
        let Some((worker, request)) = pair else { break };

        let client_id = ident::encode(&request.client_identity);
        send_worker_request(
            ctx,
            &worker.identity_bytes,
            service,
            &client_id,
            request.body,
            request.overflow,
        )
        .await;
    }
}

/// Send a REQUEST envelope to a worker, preserving any overflow frame.
/// A send failure is logged by the fault handler and the request is
/// discarded; the client times out and retries.
async fn send_worker_request(
    ctx: &BrokerCtx,
    worker_identity: &[u8],
    service: &str,
    client_id: &str,
    body: String,
    overflow: Option<Vec<u8>>,
) {
    let mut envelope = WorkerMessage::request(service, client_id, body);
    let extra = overflow.or_else(|| envelope.split_overflow());
    let bytes = match serde_json::to_vec(&envelope) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to serialize worker request");
            return;
        }
    };
    let frame = router_frames(worker_identity.to_vec(), bytes, extra);
    if ctx.send_tx.send(frame).await.is_err() {
        warn!("send channel closed, dropping worker request");
    }
}

async fn send_worker_command(ctx: &BrokerCtx, worker_identity: &[u8], message: WorkerMessage) {
    let bytes = match serde_json::to_vec(&message) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to serialize worker command");
            return;
        }
    };
    let frame = router_frames(worker_identity.to_vec(), bytes, None);
    if ctx.send_tx.send(frame).await.is_err() {
        warn!("send channel closed, dropping worker command");
    }
}

async fn send_client_reply(
    ctx: &BrokerCtx,
    client_identity: Vec<u8>,
    service: &str,
    message_id: &str,
    body: String,
) {
    let mut envelope = ClientMessage::reply(service, message_id, body);
    let extra = envelope.split_overflow();
    let bytes = match serde_json::to_vec(&envelope) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to serialize client reply");
            return;
        }
    };
    let frame = router_frames(client_identity, bytes, extra);
    if ctx.send_tx.send(frame).await.is_err() {
        warn!("send channel closed, dropping client reply");
    }
}

// ── Liveness sweep ───────────────────────────────────────────────────

/// Every heartbeat interval, evict workers past expiry plus grace via the
/// same removal path as DISCONNECT.
async fn sweep_loop(ctx: BrokerCtx, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(ctx.settings.heartbeat_interval());
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let expired = {
            let registry = ctx.registry.read().await;
            registry.expired_workers(ctx.settings.grace_period())
        };
        if expired.is_empty() {
            continue;
        }

        let mut registry = ctx.registry.write().await;
        for identity in expired {
            if let Some(record) = registry.remove_worker(&identity) {
                BrokerStats::incr(&ctx.stats.workers_evicted);
                warn!(
                    worker = %identity,
                    service = %record.service,
                    "worker liveness expired, evicting"
                );
            }
        }
    }
}

// ── Fault handler ────────────────────────────────────────────────────

/// Drains the fault channel: counts drops and distinguishes connection
/// errors from malformed traffic in the logs.
async fn fault_loop(
    mut fault_rx: mpsc::Receiver<Fault>,
    ctx: BrokerCtx,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let fault = tokio::select! {
            _ = shutdown.changed() => break,
            fault = fault_rx.recv() => match fault {
                Some(fault) => fault,
                None => break,
            },
        };
        match fault {
            Fault::Malformed(error) => {
                BrokerStats::incr(&ctx.stats.dropped);
                warn!(error = %error, "dropping malformed frame");
            }
            Fault::Send { context, error } => match error {
                DrehscheibeError::Zmq(e) => {
                    warn!(context, error = %e, "peer connection error on send")
                }
                other => warn!(context, error = %other, "transient send failure"),
            },
        }
    }
}
