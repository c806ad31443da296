//! Client peer: issues requests to services by name and correlates replies.
//!
//! The dealer socket is owned by a background event loop (send and receive
//! multiplexed with `select!`, no lock contention). Outstanding requests
//! live in a pending table keyed by message id with a secondary nonce index;
//! a timeout task reaps expired entries so every sent request resolves to
//! exactly one of: reply, timeout, service error, or shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};
use zeromq::prelude::*;
use zeromq::{DealerSocket, ZmqMessage};

use crate::config::ClientSettings;
use crate::error::DrehscheibeError;
use crate::metrics::{ClientStats, ClientStatsSnapshot};
use crate::protocol::{
    dealer_frames, generate_message_id, parse_dealer_frames, ClientMessage, ServiceRequest,
    ServiceResponse,
};
use crate::transport::Transport;

/// Reconnect pacing after a fatal socket error.
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Sweep granularity of the timeout manager.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

// ── Pending table ────────────────────────────────────────────────────

struct PendingEntry {
    service: String,
    sent_at: Instant,
    deadline: Instant,
    reply_tx: Option<oneshot::Sender<Result<ServiceResponse, DrehscheibeError>>>,
    nonce: Option<String>,
    fire_and_forget: bool,
}

struct NonceIndex {
    message_id: String,
    expires: Instant,
}

#[derive(Default)]
struct PendingMap {
    by_id: HashMap<String, PendingEntry>,
    by_nonce: HashMap<String, NonceIndex>,
}

struct Outbound {
    envelope: ClientMessage,
    overflow: Option<Vec<u8>>,
}

// ── Client ───────────────────────────────────────────────────────────

struct ClientInner {
    settings: ClientSettings,
    send_tx: mpsc::Sender<Outbound>,
    pending: Mutex<PendingMap>,
    stats: ClientStats,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// A dealer-socket request issuer with message-id and nonce correlation.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect to the broker and spawn the event and timeout tasks.
    pub async fn connect(
        transport: &Transport,
        settings: ClientSettings,
    ) -> Result<Self, DrehscheibeError> {
        let endpoint = transport.endpoint();
        let mut socket = DealerSocket::new();
        socket.connect(&endpoint).await?;
        if settings.curve.is_some() {
            debug!("curve key material supplied to socket layer");
        }
        info!(endpoint = %endpoint, "client connected");

        let (send_tx, send_rx) = mpsc::channel::<Outbound>(settings.channel_capacity);
        let (shutdown, _) = watch::channel(false);
        let latency_window = settings.latency_window;

        let inner = Arc::new(ClientInner {
            settings,
            send_tx,
            pending: Mutex::new(PendingMap::default()),
            stats: ClientStats::new(latency_window),
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let event = tokio::spawn(event_loop(
            socket,
            send_rx,
            Arc::clone(&inner),
            endpoint,
            inner.shutdown.subscribe(),
        ));
        let sweeper = tokio::spawn(timeout_loop(Arc::clone(&inner), inner.shutdown.subscribe()));
        inner.tasks.lock().expect("task list poisoned").extend([event, sweeper]);

        Ok(Self { inner })
    }

    /// Synchronous request with the default timeout and retry policy.
    pub async fn request(
        &self,
        service: &str,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<ServiceResponse, DrehscheibeError> {
        let timeout = self.inner.settings.default_timeout();
        self.request_with_timeout(service, action, payload, timeout)
            .await
    }

    /// Synchronous request with an explicit timeout.
    ///
    /// Retries on timeout or send failure up to the configured `retries`,
    /// sleeping `(attempt + 1) × 1 s` between attempts. Service errors are
    /// not retried.
    pub async fn request_with_timeout(
        &self,
        service: &str,
        action: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<ServiceResponse, DrehscheibeError> {
        let mut last = None;
        for attempt in 0..=self.inner.settings.retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                debug!(service, attempt, "retrying request");
            }
            match self
                .inner
                .send_and_wait(service, action, payload.clone(), None, timeout)
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) if is_retryable(&e) => {
                    warn!(service, attempt, error = %e, "request attempt failed");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(DrehscheibeError::Timeout))
    }

    /// Non-blocking request: the callback fires exactly once with either the
    /// reply or an error. No retries.
    pub fn request_async<F>(&self, service: &str, action: &str, payload: serde_json::Value, callback: F)
    where
        F: FnOnce(Result<ServiceResponse, DrehscheibeError>) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let service = service.to_string();
        let action = action.to_string();
        tokio::spawn(async move {
            let timeout = inner.settings.default_timeout();
            let result = inner
                .send_and_wait(&service, &action, payload, None, timeout)
                .await;
            callback(result);
        });
    }

    /// Enqueue a request without waiting for a reply.
    ///
    /// An optional nonce is recorded for best-effort response matching and
    /// expires after the configured nonce lifetime; the entry itself is
    /// reaped purely by timer.
    pub async fn request_fire_and_forget(
        &self,
        service: &str,
        action: &str,
        payload: serde_json::Value,
        nonce: Option<String>,
    ) -> Result<(), DrehscheibeError> {
        let message_id = generate_message_id();
        let expiry = self.inner.settings.nonce_expiry();
        let body = serialize_request(&message_id, service, action, payload, nonce.clone(), None)?;

        {
            let mut pending = self.inner.pending.lock().await;
            let now = Instant::now();
            if let Some(n) = nonce.clone() {
                pending.by_nonce.insert(
                    n,
                    NonceIndex {
                        message_id: message_id.clone(),
                        expires: now + expiry,
                    },
                );
            }
            pending.by_id.insert(
                message_id.clone(),
                PendingEntry {
                    service: service.to_string(),
                    sent_at: now,
                    deadline: now + expiry,
                    reply_tx: None,
                    nonce,
                    fire_and_forget: true,
                },
            );
        }

        ClientStats::incr(&self.inner.stats.requests_sent);
        self.inner.enqueue(service, &message_id, body).await
    }

    /// Counter snapshot with the rolling latency mean.
    pub fn stats(&self) -> ClientStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Signal shutdown, fail outstanding requests, and stop all tasks.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        let handles: Vec<_> = {
            let mut tasks = self.inner.tasks.lock().expect("task list poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("client stopped");
    }
}

impl ClientInner {
    /// One attempt: register the pending entry, enqueue the send, await the
    /// sink. Resolution comes from the reply dispatcher or the timeout task.
    async fn send_and_wait(
        &self,
        service: &str,
        action: &str,
        payload: serde_json::Value,
        nonce: Option<String>,
        timeout: Duration,
    ) -> Result<ServiceResponse, DrehscheibeError> {
        let message_id = generate_message_id();
        let body = serialize_request(
            &message_id,
            service,
            action,
            payload,
            nonce.clone(),
            Some(timeout.as_secs()),
        )?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            let now = Instant::now();
            if let Some(n) = nonce.clone() {
                pending.by_nonce.insert(
                    n,
                    NonceIndex {
                        message_id: message_id.clone(),
                        expires: now + self.settings.nonce_expiry(),
                    },
                );
            }
            pending.by_id.insert(
                message_id.clone(),
                PendingEntry {
                    service: service.to_string(),
                    sent_at: now,
                    deadline: now + timeout,
                    reply_tx: Some(tx),
                    nonce,
                    fire_and_forget: false,
                },
            );
        }

        ClientStats::incr(&self.stats.requests_sent);
        if let Err(e) = self.enqueue(service, &message_id, body).await {
            self.remove_pending(&message_id).await;
            ClientStats::incr(&self.stats.failures);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            // The sender side disappeared without resolving: shutdown.
            Err(_) => Err(DrehscheibeError::Shutdown),
        }
    }

    /// Build the REQ envelope and hand it to the socket loop.
    async fn enqueue(
        &self,
        service: &str,
        message_id: &str,
        body: String,
    ) -> Result<(), DrehscheibeError> {
        let mut envelope = ClientMessage::request(service, message_id, body);
        let overflow = envelope.split_overflow();
        self.send_tx
            .send(Outbound { envelope, overflow })
            .await
            .map_err(|_| DrehscheibeError::Transport("client event loop closed".into()))
    }

    async fn remove_pending(&self, message_id: &str) {
        let mut pending = self.pending.lock().await;
        if let Some(entry) = pending.by_id.remove(message_id) {
            if let Some(n) = &entry.nonce {
                pending.by_nonce.remove(n);
            }
        }
    }
}

fn serialize_request(
    message_id: &str,
    service: &str,
    action: &str,
    payload: serde_json::Value,
    nonce: Option<String>,
    timeout_secs: Option<u64>,
) -> Result<String, DrehscheibeError> {
    let request = ServiceRequest {
        message_id: message_id.to_string(),
        service: service.to_string(),
        action: action.to_string(),
        payload,
        nonce,
        timeout: timeout_secs,
    };
    Ok(serde_json::to_string(&request)?)
}

fn is_retryable(error: &DrehscheibeError) -> bool {
    matches!(
        error,
        DrehscheibeError::Timeout | DrehscheibeError::Transport(_) | DrehscheibeError::Zmq(_)
    )
}

// ── Event loop ───────────────────────────────────────────────────────

/// Owns the dealer socket: multiplexes outbound sends with inbound replies,
/// reconnecting with exponential backoff on fatal socket errors.
async fn event_loop(
    mut socket: DealerSocket,
    mut send_rx: mpsc::Receiver<Outbound>,
    inner: Arc<ClientInner>,
    endpoint: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    'outer: loop {
        let reconnect = loop {
            tokio::select! {
                _ = shutdown.changed() => break 'outer,
                Some(out) = send_rx.recv() => {
                    let message_id = out.envelope.message_id.clone();
                    match serde_json::to_vec(&out.envelope) {
                        Ok(bytes) => {
                            // A send that errors or stalls both fail the
                            // attempt; the caller's retry policy takes over.
                            let sent = tokio::time::timeout(
                                Duration::from_secs(5),
                                socket.send(dealer_frames(bytes, out.overflow)),
                            )
                            .await;
                            match sent {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    warn!(error = %e, "send failed, failing request");
                                    fail_pending(&inner, &message_id, DrehscheibeError::Transport(e.to_string())).await;
                                    break true;
                                }
                                Err(_) => {
                                    warn!("send stalled, failing request");
                                    fail_pending(&inner, &message_id, DrehscheibeError::Transport("send stalled".into())).await;
                                    break true;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to serialize request envelope");
                            fail_pending(&inner, &message_id, e.into()).await;
                        }
                    }
                }
                result = socket.recv() => match result {
                    Ok(msg) => {
                        attempt = 0;
                        dispatch_reply(&inner, &msg).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "socket recv error");
                        break true;
                    }
                }
            }
        };

        if reconnect {
            let delay = std::cmp::min(RECONNECT_MAX, RECONNECT_BASE * 2u32.saturating_pow(attempt));
            attempt = attempt.saturating_add(1);
            info!(endpoint = %endpoint, attempt, delay_ms = delay.as_millis() as u64, "client reconnecting");
            tokio::select! {
                _ = shutdown.changed() => break 'outer,
                _ = tokio::time::sleep(delay) => {}
            }
            let mut fresh = DealerSocket::new();
            match fresh.connect(&endpoint).await {
                Ok(()) => {
                    socket = fresh;
                    info!(endpoint = %endpoint, "client reconnected");
                }
                Err(e) => {
                    warn!(error = %e, "client reconnect failed");
                }
            }
        }
    }
    debug!("client event loop stopped");
}

/// Resolve a pending entry with an error, if it still exists.
async fn fail_pending(inner: &ClientInner, message_id: &str, error: DrehscheibeError) {
    let entry = {
        let mut pending = inner.pending.lock().await;
        let entry = pending.by_id.remove(message_id);
        if let Some(e) = &entry {
            if let Some(n) = &e.nonce {
                pending.by_nonce.remove(n);
            }
        }
        entry
    };
    if let Some(entry) = entry {
        if let Some(tx) = entry.reply_tx {
            let _ = tx.send(Err(error));
        }
    }
}

/// Correlate an inbound reply: message id first, then nonce. Replies that
/// match nothing are late fire-and-forget responses (silent when they carry
/// a nonce) or stray traffic (warned).
async fn dispatch_reply(inner: &ClientInner, msg: &ZmqMessage) {
    let (envelope, overflow) = match parse_dealer_frames(msg) {
        Ok(parts) => parts,
        Err(e) => {
            warn!(error = %e, "dropping malformed reply frame");
            return;
        }
    };
    let message: ClientMessage = match serde_json::from_slice(&envelope) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "dropping undecodable reply envelope");
            return;
        }
    };
    let body = message.effective_body(overflow);
    let response: ServiceResponse = match serde_json::from_str(&body) {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "dropping undecodable response body");
            return;
        }
    };

    let entry = {
        let mut pending = inner.pending.lock().await;
        let entry = pending.by_id.remove(&response.message_id).or_else(|| {
            let nonce = response.nonce.as_ref()?;
            let index = pending.by_nonce.remove(nonce)?;
            pending.by_id.remove(&index.message_id)
        });
        if let Some(e) = &entry {
            if let Some(n) = &e.nonce {
                pending.by_nonce.remove(n);
            }
        }
        entry
    };

    match entry {
        Some(entry) => {
            ClientStats::incr(&inner.stats.responses_received);
            inner
                .stats
                .record_latency(entry.sent_at.elapsed().as_secs_f64() * 1000.0);
            debug!(
                service = %entry.service,
                message_id = %response.message_id,
                success = response.success,
                "reply correlated"
            );
            if let Some(tx) = entry.reply_tx {
                let result = if response.success {
                    Ok(response)
                } else {
                    let reason = response
                        .error
                        .clone()
                        .unwrap_or_else(|| "unspecified".into());
                    ClientStats::incr(&inner.stats.failures);
                    Err(DrehscheibeError::Service(reason))
                };
                let _ = tx.send(result);
            }
        }
        None if response.nonce.is_some() => {
            // A fire-and-forget reply whose nonce already expired.
            debug!(message_id = %response.message_id, "late reply for expired nonce, discarding");
        }
        None => {
            warn!(message_id = %response.message_id, "reply with unknown message id, dropping");
        }
    }
}

// ── Timeout manager ──────────────────────────────────────────────────

/// Reap expired pending entries and nonce index records. On shutdown,
/// outstanding sinks receive a shutdown error so callers never hang.
async fn timeout_loop(inner: Arc<ClientInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        let mut resolved = Vec::new();
        {
            let mut pending = inner.pending.lock().await;
            let expired: Vec<String> = pending
                .by_id
                .iter()
                .filter(|(_, e)| now >= e.deadline)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                if let Some(entry) = pending.by_id.remove(&id) {
                    if let Some(n) = &entry.nonce {
                        pending.by_nonce.remove(n);
                    }
                    resolved.push((id, entry));
                }
            }
            pending.by_nonce.retain(|_, index| now < index.expires);
        }

        for (id, entry) in resolved {
            if entry.fire_and_forget {
                debug!(message_id = %id, "fire-and-forget entry reaped");
            } else {
                ClientStats::incr(&inner.stats.timeouts);
                warn!(message_id = %id, service = %entry.service, "request timed out");
                if let Some(tx) = entry.reply_tx {
                    let _ = tx.send(Err(DrehscheibeError::Timeout));
                }
            }
        }
    }

    // Shutdown: fail whatever is still outstanding.
    let mut pending = inner.pending.lock().await;
    for (_, entry) in pending.by_id.drain() {
        if let Some(tx) = entry.reply_tx {
            let _ = tx.send(Err(DrehscheibeError::Shutdown));
        }
    }
    pending.by_nonce.clear();
}
