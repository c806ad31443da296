//! Wire-format definitions shared by broker, worker, and client peers.
//!
//! Two protocol families share one framed representation:
//! `[peer_identity, empty_delimiter, json_envelope, (optional overflow body)]`.
//! The identity frame exists only on the ROUTER side — zeromq-rs pushes the
//! peer identity as the first frame on recv and pops it on send, so DEALER
//! peers see `[empty, envelope, (overflow)]`.
//!
//! Worker and client command constants collide (`READY` and `REQ` are both
//! `"\x01"`); receivers must classify on the `protocol` header before
//! interpreting the command.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use zeromq::ZmqMessage;

use crate::error::DrehscheibeError;

// ── Protocol headers ─────────────────────────────────────────────────

/// Protocol header carried by every worker-side envelope.
pub const WORKER_PROTOCOL: &str = "MDPW01";

/// Protocol header carried by every client-side envelope.
pub const CLIENT_PROTOCOL: &str = "MDPC01";

// ── Reserved names ───────────────────────────────────────────────────

/// Service routed directly to the first ready worker, bypassing the queue.
/// Registration of a worker on this service also triggers the immediate
/// device-list handshake.
pub const HUB_CONTROL_SERVICE: &str = "hub.control";

/// Client identity the broker uses when issuing its own device-list request.
/// Replies addressed to it on [`HUB_CONTROL_SERVICE`] are candidates for the
/// device-list hook rather than client delivery.
pub const GATEWAY_CLIENT_ID: &str = "gateway_main";

/// Action name of the broker-synthesized device-list handshake request.
pub const DEVICE_LIST_ACTION: &str = "list";

/// Bodies larger than this move out of the JSON envelope into a trailing
/// overflow frame.
pub const MAX_INLINE_BODY: usize = 256 * 1024;

// ── Commands ─────────────────────────────────────────────────────────

/// Worker-side commands. The wire values are single control bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerCommand {
    #[serde(rename = "\u{01}")]
    Ready,
    #[serde(rename = "\u{02}")]
    Request,
    #[serde(rename = "\u{03}")]
    Reply,
    #[serde(rename = "\u{04}")]
    Heartbeat,
    #[serde(rename = "\u{05}")]
    Disconnect,
}

/// Client-side commands. `Req` shares its wire value with
/// [`WorkerCommand::Ready`]; the `protocol` header disambiguates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientCommand {
    #[serde(rename = "\u{01}")]
    Req,
    #[serde(rename = "\u{02}")]
    Rep,
}

// ── Envelopes ────────────────────────────────────────────────────────

/// Envelope exchanged between the broker and workers (`MDPW01`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub protocol: String,
    pub command: WorkerCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Envelope exchanged between clients and the broker (`MDPC01`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol: String,
    pub command: ClientCommand,
    pub service: String,
    pub message_id: String,
    pub body: String,
}

/// Application-level request carried as an envelope body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub message_id: String,
    pub service: String,
    pub action: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Application-level response carried as an envelope body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub message_id: String,
    pub service: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl ServiceResponse {
    /// Build a `success = false` response mirroring a request's correlation
    /// fields.
    pub fn failure(
        message_id: impl Into<String>,
        service: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            service: service.into(),
            success: false,
            data: None,
            error: Some(error.into()),
            nonce: None,
        }
    }

    /// Whether the `data` field structurally matches a device-list reply
    /// (an object carrying both `devices` and `hub_id`).
    pub fn is_device_list(&self) -> bool {
        self.data
            .as_ref()
            .and_then(|d| d.as_object())
            .map(|obj| obj.contains_key("devices") && obj.contains_key("hub_id"))
            .unwrap_or(false)
    }
}

impl WorkerMessage {
    fn new(command: WorkerCommand) -> Self {
        Self {
            protocol: WORKER_PROTOCOL.to_string(),
            command,
            service: None,
            body: None,
            client_id: None,
        }
    }

    /// READY — advertise a service to the broker.
    pub fn ready(service: impl Into<String>) -> Self {
        let mut msg = Self::new(WorkerCommand::Ready);
        msg.service = Some(service.into());
        msg
    }

    /// REQUEST — broker dispatches a client request to a worker.
    pub fn request(
        service: impl Into<String>,
        client_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(WorkerCommand::Request);
        msg.service = Some(service.into());
        msg.client_id = Some(client_id.into());
        msg.body = Some(body.into());
        msg
    }

    /// REPLY — worker returns a response for the originating client.
    pub fn reply(
        service: impl Into<String>,
        client_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(WorkerCommand::Reply);
        msg.service = Some(service.into());
        msg.client_id = Some(client_id.into());
        msg.body = Some(body.into());
        msg
    }

    /// HEARTBEAT — liveness keepalive, sent in both directions.
    pub fn heartbeat() -> Self {
        Self::new(WorkerCommand::Heartbeat)
    }

    /// DISCONNECT — orderly goodbye, or a broker's request to re-register.
    pub fn disconnect() -> Self {
        Self::new(WorkerCommand::Disconnect)
    }

    /// Move an oversized body out of the envelope, returning it as the
    /// overflow frame payload.
    pub fn split_overflow(&mut self) -> Option<Vec<u8>> {
        match &self.body {
            Some(body) if body.len() > MAX_INLINE_BODY => {
                self.body.take().map(String::into_bytes)
            }
            _ => None,
        }
    }

    /// Resolve the effective body: the envelope field when present and
    /// non-empty, otherwise the overflow frame.
    pub fn effective_body(&self, overflow: Option<Vec<u8>>) -> Option<String> {
        match &self.body {
            Some(body) if !body.is_empty() => Some(body.clone()),
            _ => overflow.and_then(|bytes| String::from_utf8(bytes).ok()),
        }
    }

    /// Reject envelopes missing required fields for their command.
    pub fn validate(&self) -> Result<(), DrehscheibeError> {
        if self.protocol != WORKER_PROTOCOL {
            return Err(DrehscheibeError::Protocol(format!(
                "unexpected worker protocol header '{}'",
                self.protocol
            )));
        }
        match self.command {
            WorkerCommand::Ready if self.service.as_deref().unwrap_or("").is_empty() => Err(
                DrehscheibeError::Protocol("READY requires a service name".into()),
            ),
            WorkerCommand::Reply if self.client_id.as_deref().unwrap_or("").is_empty() => Err(
                DrehscheibeError::Protocol("REPLY requires a client id".into()),
            ),
            _ => Ok(()),
        }
    }
}

impl ClientMessage {
    /// REQ — a client request addressed to a service by name.
    pub fn request(
        service: impl Into<String>,
        message_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            protocol: CLIENT_PROTOCOL.to_string(),
            command: ClientCommand::Req,
            service: service.into(),
            message_id: message_id.into(),
            body: body.into(),
        }
    }

    /// REP — the broker's reply frame back to a client.
    pub fn reply(
        service: impl Into<String>,
        message_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            protocol: CLIENT_PROTOCOL.to_string(),
            command: ClientCommand::Rep,
            service: service.into(),
            message_id: message_id.into(),
            body: body.into(),
        }
    }

    /// Move an oversized body out of the envelope, returning it as the
    /// overflow frame payload.
    pub fn split_overflow(&mut self) -> Option<Vec<u8>> {
        if self.body.len() > MAX_INLINE_BODY {
            Some(std::mem::take(&mut self.body).into_bytes())
        } else {
            None
        }
    }

    /// Resolve the effective body (envelope field or overflow frame).
    pub fn effective_body(&self, overflow: Option<Vec<u8>>) -> String {
        if !self.body.is_empty() {
            self.body.clone()
        } else {
            overflow
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .unwrap_or_default()
        }
    }

    /// Reject envelopes missing required fields for their command.
    pub fn validate(&self) -> Result<(), DrehscheibeError> {
        if self.protocol != CLIENT_PROTOCOL {
            return Err(DrehscheibeError::Protocol(format!(
                "unexpected client protocol header '{}'",
                self.protocol
            )));
        }
        if self.command == ClientCommand::Req
            && (self.service.is_empty() || self.message_id.is_empty())
        {
            return Err(DrehscheibeError::Protocol(
                "REQ requires both service and message id".into(),
            ));
        }
        Ok(())
    }
}

// ── Classification ───────────────────────────────────────────────────

/// A parsed envelope, classified by its protocol header.
#[derive(Debug, Clone)]
pub enum Envelope {
    Worker(WorkerMessage),
    Client(ClientMessage),
}

/// Parse an envelope frame and classify it by protocol header.
///
/// Classification happens before the command is interpreted because worker
/// and client command bytes overlap.
pub fn classify(raw: &[u8]) -> Result<Envelope, DrehscheibeError> {
    let value: serde_json::Value = serde_json::from_slice(raw)?;
    match value.get("protocol").and_then(|p| p.as_str()) {
        Some(WORKER_PROTOCOL) => {
            let msg: WorkerMessage = serde_json::from_value(value)?;
            msg.validate()?;
            Ok(Envelope::Worker(msg))
        }
        Some(CLIENT_PROTOCOL) => {
            let msg: ClientMessage = serde_json::from_value(value)?;
            msg.validate()?;
            Ok(Envelope::Client(msg))
        }
        Some(other) => Err(DrehscheibeError::Protocol(format!(
            "unknown protocol header '{other}'"
        ))),
        None => Err(DrehscheibeError::Protocol(
            "envelope missing protocol header".into(),
        )),
    }
}

// ── Message ids ──────────────────────────────────────────────────────

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a message id unique within this process.
///
/// Nanosecond timestamp plus a per-process counter; the counter alone
/// guarantees uniqueness, the timestamp keeps ids roughly sortable.
pub fn generate_message_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("msg_{nanos}_{seq}")
}

/// Generate a nonce for fire-and-forget correlation.
pub fn generate_nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ── Peer identities ──────────────────────────────────────────────────

/// Hex codec for router-observed identity frames.
///
/// The broker keys workers and clients by the string form; reply routing
/// decodes it back to raw frame bytes. The reserved [`GATEWAY_CLIENT_ID`]
/// contains non-hex characters so it can never collide with an encoding.
pub mod ident {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn decode(s: &str) -> Option<Vec<u8>> {
        if s.is_empty() || s.len() % 2 != 0 {
            return None;
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
            .collect()
    }
}

// ── Framing ──────────────────────────────────────────────────────────

/// Build the frames a DEALER peer sends: `[empty, envelope, (overflow)]`.
pub fn dealer_frames(envelope: Vec<u8>, overflow: Option<Vec<u8>>) -> ZmqMessage {
    let mut msg = ZmqMessage::from(Vec::<u8>::new());
    msg.push_back(envelope.into());
    if let Some(extra) = overflow {
        msg.push_back(extra.into());
    }
    msg
}

/// Build the frames the ROUTER sends: `[identity, empty, envelope, (overflow)]`.
/// zeromq-rs pops the identity frame and routes the rest to the peer.
pub fn router_frames(identity: Vec<u8>, envelope: Vec<u8>, overflow: Option<Vec<u8>>) -> ZmqMessage {
    let mut msg = ZmqMessage::from(identity);
    msg.push_back(Vec::<u8>::new().into());
    msg.push_back(envelope.into());
    if let Some(extra) = overflow {
        msg.push_back(extra.into());
    }
    msg
}

/// Parse frames received on a DEALER socket into `(envelope, overflow)`.
///
/// Leading empty delimiter frames are skipped; anything after the envelope
/// frame is the overflow body.
pub fn parse_dealer_frames(msg: &ZmqMessage) -> Result<(Vec<u8>, Option<Vec<u8>>), DrehscheibeError> {
    let frames: Vec<&[u8]> = msg.iter().map(|f| f.as_ref()).collect();
    let data: Vec<&[u8]> = frames
        .iter()
        .copied()
        .skip_while(|f| f.is_empty())
        .collect();
    if data.is_empty() {
        return Err(DrehscheibeError::Protocol(format!(
            "expected [envelope] after delimiter, got {} frames",
            frames.len()
        )));
    }
    let overflow = data.get(1).map(|f| f.to_vec());
    Ok((data[0].to_vec(), overflow))
}

/// Parse frames received on the ROUTER socket into
/// `(identity, envelope, overflow)`.
pub fn parse_router_frames(
    msg: &ZmqMessage,
) -> Result<(Vec<u8>, Vec<u8>, Option<Vec<u8>>), DrehscheibeError> {
    let frames: Vec<&[u8]> = msg.iter().map(|f| f.as_ref()).collect();
    if frames.len() < 2 {
        return Err(DrehscheibeError::Protocol(format!(
            "expected at least [identity, envelope], got {} frames",
            frames.len()
        )));
    }
    let identity = frames[0].to_vec();
    let data: Vec<&[u8]> = frames[1..]
        .iter()
        .copied()
        .skip_while(|f| f.is_empty())
        .collect();
    if data.is_empty() {
        return Err(DrehscheibeError::Protocol(
            "no envelope frame after identity".into(),
        ));
    }
    let overflow = data.get(1).map(|f| f.to_vec());
    Ok((identity, data[0].to_vec(), overflow))
}
