//! Worker peer: advertises one service to the broker, executes a pluggable
//! [`RequestHandler`] per REQUEST, and keeps itself registered through
//! heartbeats and reconnection.
//!
//! Lifecycle: `Disconnected → Connecting → Ready ⇄ Working`, falling back to
//! `Reconnecting` on connection loss or liveness exhaustion. Handlers run on
//! their own tasks so a slow request never blocks the socket loop; replies
//! funnel back through a bounded channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use zeromq::prelude::*;
use zeromq::DealerSocket;

use crate::config::WorkerSettings;
use crate::error::DrehscheibeError;
use crate::protocol::{
    dealer_frames, parse_dealer_frames, ServiceRequest, ServiceResponse, WorkerCommand,
    WorkerMessage,
};
use crate::traits::RequestHandler;
use crate::transport::Transport;

// ── State ────────────────────────────────────────────────────────────

/// Connection state, observable via [`Worker::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Ready,
    Working,
    Reconnecting,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Working => "working",
            Self::Reconnecting => "reconnecting",
        }
    }
}

type SharedState = Arc<std::sync::Mutex<WorkerState>>;

fn set_state(state: &SharedState, value: WorkerState) {
    *state.lock().expect("worker state poisoned") = value;
}

// ── Builder ──────────────────────────────────────────────────────────

/// Fluent builder for a [`Worker`].
///
/// # Example
/// ```ignore
/// let worker = Worker::builder("echo", Transport::tcp("127.0.0.1", 5570))
///     .handler(Arc::new(EchoHandler))
///     .build();
/// worker.start().await?;
/// ```
pub struct WorkerBuilder {
    service: String,
    transport: Transport,
    settings: WorkerSettings,
    handler: Option<Arc<dyn RequestHandler>>,
}

impl WorkerBuilder {
    pub fn new(service: impl Into<String>, transport: Transport) -> Self {
        Self {
            service: service.into(),
            transport,
            settings: WorkerSettings::default(),
            handler: None,
        }
    }

    /// Install the request handler. Without one, every request is answered
    /// with a synthesized error response.
    pub fn handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Worker {
        let (shutdown, _) = watch::channel(false);
        Worker {
            ctx: WorkerCtx {
                service: self.service,
                endpoint: self.transport.endpoint(),
                settings: self.settings,
                handler: self.handler,
                state: Arc::new(std::sync::Mutex::new(WorkerState::Disconnected)),
            },
            shutdown,
            task: std::sync::Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }
}

// ── Worker ───────────────────────────────────────────────────────────

/// Everything the run loop needs, cloneable into spawned tasks.
#[derive(Clone)]
struct WorkerCtx {
    service: String,
    endpoint: String,
    settings: WorkerSettings,
    handler: Option<Arc<dyn RequestHandler>>,
    state: SharedState,
}

/// A dealer-socket service provider.
pub struct Worker {
    ctx: WorkerCtx,
    shutdown: watch::Sender<bool>,
    task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    started: AtomicBool,
}

impl Worker {
    pub fn builder(service: impl Into<String>, transport: Transport) -> WorkerBuilder {
        WorkerBuilder::new(service, transport)
    }

    /// Connect to the broker, register the service, and spawn the run loop.
    ///
    /// The initial connect retries with linear backoff and surfaces failure;
    /// later disconnections are handled internally with exponential backoff.
    pub async fn start(&self) -> Result<(), DrehscheibeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DrehscheibeError::Transport("worker already started".into()));
        }
        if self.ctx.settings.curve.is_some() {
            debug!("curve key material supplied to socket layer");
        }

        set_state(&self.ctx.state, WorkerState::Connecting);
        let mut socket = connect_with_retry(&self.ctx).await.map_err(|e| {
            set_state(&self.ctx.state, WorkerState::Disconnected);
            e
        })?;
        send_message(&mut socket, WorkerMessage::ready(&self.ctx.service), None).await?;
        set_state(&self.ctx.state, WorkerState::Ready);
        info!(service = %self.ctx.service, endpoint = %self.ctx.endpoint, "worker registered");

        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(run_loop(socket, ctx, shutdown));
        *self.task.lock().expect("task slot poisoned") = Some(handle);
        Ok(())
    }

    /// Send a best-effort DISCONNECT, stop all internal tasks, and close the
    /// socket. In-flight handler work is not interrupted; its reply is
    /// simply never sent.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.task.lock().expect("task slot poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        set_state(&self.ctx.state, WorkerState::Disconnected);
        info!(service = %self.ctx.service, "worker stopped");
    }

    /// Current connection state.
    pub fn state(&self) -> WorkerState {
        *self.ctx.state.lock().expect("worker state poisoned")
    }

    /// The advertised service name.
    pub fn service(&self) -> &str {
        &self.ctx.service
    }
}

// ── Connect / reconnect ──────────────────────────────────────────────

/// Initial connect: up to `connect_attempts` tries with linear backoff.
async fn connect_with_retry(ctx: &WorkerCtx) -> Result<DealerSocket, DrehscheibeError> {
    let mut last = String::new();
    for attempt in 1..=ctx.settings.connect_attempts {
        match connect_once(&ctx.endpoint).await {
            Ok(socket) => return Ok(socket),
            Err(e) => {
                last = e.to_string();
                debug!(attempt, error = %last, "connect attempt failed");
                tokio::time::sleep(ctx.settings.connect_backoff() * attempt).await;
            }
        }
    }
    Err(DrehscheibeError::Connect {
        endpoint: ctx.endpoint.clone(),
        attempts: ctx.settings.connect_attempts,
        last,
    })
}

async fn connect_once(endpoint: &str) -> Result<DealerSocket, DrehscheibeError> {
    let mut socket = DealerSocket::new();
    socket.connect(endpoint).await?;
    Ok(socket)
}

/// Exponential backoff `min(max, base × 2^attempt)` with ±25% jitter.
fn reconnect_delay(settings: &WorkerSettings, attempt: u32) -> Duration {
    let base = settings.reconnect_base().as_millis() as u64;
    let max = settings.reconnect_max().as_millis() as u64;
    let exp = base.saturating_mul(1u64 << attempt.min(16)).min(max.max(1));
    let span = exp / 4;
    let jitter = if span == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=span * 2) as i64 - span as i64
    };
    Duration::from_millis((exp as i64 + jitter).max(1) as u64)
}

/// Heartbeat interval with a per-connection offset so a fleet of workers
/// does not tick in lockstep. The offset is bounded by a fifth of the
/// interval, capped at five seconds.
fn jittered_heartbeat(settings: &WorkerSettings) -> Duration {
    let base = settings.heartbeat_interval().as_millis() as u64;
    let span = (base / 5).min(5_000);
    if span == 0 {
        return settings.heartbeat_interval();
    }
    let offset = rand::thread_rng().gen_range(0..=span * 2) as i64 - span as i64;
    Duration::from_millis((base as i64 + offset).max(1) as u64)
}

// ── Run loop ─────────────────────────────────────────────────────────

enum SessionEnd {
    Shutdown,
    Reconnect,
}

async fn run_loop(mut socket: DealerSocket, ctx: WorkerCtx, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;
    loop {
        match session(&mut socket, &ctx, &mut shutdown).await {
            SessionEnd::Shutdown => {
                set_state(&ctx.state, WorkerState::Disconnected);
                return;
            }
            SessionEnd::Reconnect => {
                set_state(&ctx.state, WorkerState::Reconnecting);
            }
        }

        // Reconnect with exponential backoff; in-flight requests are lost
        // and clients re-issue or time out.
        loop {
            let delay = reconnect_delay(&ctx.settings, attempt);
            info!(service = %ctx.service, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                _ = shutdown.changed() => {
                    set_state(&ctx.state, WorkerState::Disconnected);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            set_state(&ctx.state, WorkerState::Connecting);
            match connect_once(&ctx.endpoint).await {
                Ok(mut fresh) => {
                    let ready = tokio::time::timeout(
                        Duration::from_secs(2),
                        send_message(&mut fresh, WorkerMessage::ready(&ctx.service), None),
                    )
                    .await;
                    match ready {
                        Ok(Ok(())) => {
                            socket = fresh;
                            attempt = 0;
                            set_state(&ctx.state, WorkerState::Ready);
                            info!(service = %ctx.service, "worker re-registered");
                            break;
                        }
                        Ok(Err(e)) => {
                            warn!(error = %e, "re-registration failed");
                            attempt = attempt.saturating_add(1);
                        }
                        Err(_) => {
                            warn!(service = %ctx.service, "re-registration stalled");
                            attempt = attempt.saturating_add(1);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "reconnect failed");
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

/// One connected session: heartbeat, receive, and reply until the
/// connection dies or shutdown is signalled.
async fn session(
    socket: &mut DealerSocket,
    ctx: &WorkerCtx,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut liveness = ctx.settings.liveness_budget;
    let mut ticker = tokio::time::interval(jittered_heartbeat(&ctx.settings));
    ticker.tick().await; // the immediate first tick

    let (reply_tx, mut reply_rx) =
        mpsc::channel::<(WorkerMessage, Option<Vec<u8>>)>(ctx.settings.channel_capacity);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // Best-effort goodbye; a dead link must not stall shutdown.
                let goodbye = tokio::time::timeout(
                    Duration::from_millis(500),
                    send_message(socket, WorkerMessage::disconnect(), None),
                )
                .await;
                if !matches!(goodbye, Ok(Ok(()))) {
                    debug!(service = %ctx.service, "best-effort disconnect failed");
                }
                return SessionEnd::Shutdown;
            }
            _ = ticker.tick() => {
                // A send that errors or stalls both mean the link is gone.
                let sent = tokio::time::timeout(
                    ctx.settings.heartbeat_interval(),
                    send_message(socket, WorkerMessage::heartbeat(), None),
                )
                .await;
                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(error = %e, "heartbeat send failed");
                        return SessionEnd::Reconnect;
                    }
                    Err(_) => {
                        warn!(service = %ctx.service, "heartbeat send stalled");
                        return SessionEnd::Reconnect;
                    }
                }
                liveness = liveness.saturating_sub(1);
                if liveness == 0 {
                    warn!(service = %ctx.service, "broker unresponsive, liveness exhausted");
                    return SessionEnd::Reconnect;
                }
            }
            Some((reply, extra)) = reply_rx.recv() => {
                set_state(&ctx.state, WorkerState::Ready);
                let sent = tokio::time::timeout(
                    Duration::from_secs(5),
                    send_message(socket, reply, extra),
                )
                .await;
                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(error = %e, "reply send failed");
                        return SessionEnd::Reconnect;
                    }
                    Err(_) => {
                        warn!(service = %ctx.service, "reply send stalled");
                        return SessionEnd::Reconnect;
                    }
                }
            }
            result = socket.recv() => match result {
                Ok(msg) => {
                    // Any broker traffic proves the link is alive.
                    liveness = ctx.settings.liveness_budget;
                    let (envelope, overflow) = match parse_dealer_frames(&msg) {
                        Ok(parts) => parts,
                        Err(e) => {
                            warn!(error = %e, "dropping malformed frame");
                            continue;
                        }
                    };
                    let message: WorkerMessage = match serde_json::from_slice(&envelope) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(error = %e, "dropping undecodable envelope");
                            continue;
                        }
                    };
                    match message.command {
                        WorkerCommand::Heartbeat => {}
                        WorkerCommand::Request => {
                            set_state(&ctx.state, WorkerState::Working);
                            dispatch_request(ctx, message, overflow, reply_tx.clone());
                        }
                        WorkerCommand::Disconnect => {
                            info!(service = %ctx.service, "broker requested re-registration");
                            return SessionEnd::Reconnect;
                        }
                        other => debug!(command = ?other, "ignoring unexpected command"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "socket recv error");
                    return SessionEnd::Reconnect;
                }
            }
        }
    }
}

// ── Request handling ─────────────────────────────────────────────────

/// Run the handler on its own task and funnel the reply back to the socket
/// loop.
fn dispatch_request(
    ctx: &WorkerCtx,
    message: WorkerMessage,
    overflow: Option<Vec<u8>>,
    reply_tx: mpsc::Sender<(WorkerMessage, Option<Vec<u8>>)>,
) {
    let Some(client_id) = message.client_id.clone().filter(|id| !id.is_empty()) else {
        warn!("REQUEST without client id, dropping");
        return;
    };
    let body = message.effective_body(overflow).unwrap_or_default();
    let handler = ctx.handler.clone();
    let service = ctx.service.clone();

    tokio::spawn(async move {
        let response = run_handler(handler, &service, body.as_bytes()).await;
        let mut reply = WorkerMessage::reply(&service, &client_id, response);
        let extra = reply.split_overflow();
        if reply_tx.send((reply, extra)).await.is_err() {
            // Session ended while the handler ran; the reply is lost and the
            // client times out.
            debug!(service = %service, "session gone, dropping reply");
        }
    });
}

/// Invoke the handler and produce the reply body.
///
/// Handlers that return a complete serialized [`ServiceResponse`] pass
/// through verbatim; any other output is wrapped in a `success = true`
/// response. Handler errors and a missing handler become `success = false`
/// responses carrying the request's correlation fields.
async fn run_handler(
    handler: Option<Arc<dyn RequestHandler>>,
    service: &str,
    request: &[u8],
) -> String {
    let parsed: Option<ServiceRequest> = serde_json::from_slice(request).ok();
    let (message_id, nonce) = parsed
        .map(|r| (r.message_id, r.nonce))
        .unwrap_or_default();

    let result = match handler {
        Some(handler) => handler.handle(request).await,
        None => Err(DrehscheibeError::NoHandler(service.to_string())),
    };

    let response = match result {
        Ok(bytes) => {
            if serde_json::from_slice::<ServiceResponse>(&bytes).is_ok() {
                return String::from_utf8_lossy(&bytes).into_owned();
            }
            let data = serde_json::from_slice::<serde_json::Value>(&bytes)
                .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned()));
            ServiceResponse {
                message_id,
                service: service.to_string(),
                success: true,
                data: Some(data),
                error: None,
                nonce,
            }
        }
        Err(e) => {
            let mut failure = ServiceResponse::failure(message_id, service, e.to_string());
            failure.nonce = nonce;
            failure
        }
    };
    serde_json::to_string(&response).unwrap_or_else(|e| {
        warn!(error = %e, "failed to serialize response");
        String::new()
    })
}

/// Serialize and send one envelope over the dealer socket, splitting
/// oversized bodies into the overflow frame.
async fn send_message(
    socket: &mut DealerSocket,
    mut message: WorkerMessage,
    extra: Option<Vec<u8>>,
) -> Result<(), DrehscheibeError> {
    let extra = extra.or_else(|| message.split_overflow());
    let bytes = serde_json::to_vec(&message)?;
    socket.send(dealer_frames(bytes, extra)).await?;
    Ok(())
}
