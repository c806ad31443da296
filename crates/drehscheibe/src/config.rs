//! Configuration for the drehscheibe messaging layer.
//!
//! Parsed from `drehscheibe.toml` with support for environment variable
//! overrides. Every protocol tunable has a default matching the deployed
//! gateway fleet; section structs can also be built directly in code.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DrehscheibeError;
use crate::transport::{CurveKeys, Transport};

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration: broker, worker, and client sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrehscheibeConfig {
    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub client: ClientSettings,
}

// ── Broker section ──────────────────────────────────────────────────

/// Broker section: router socket endpoint and liveness policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Endpoint the router socket binds (`tcp://host:port` or `ipc://...`).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Nominal heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Consecutive missed heartbeats tolerated before a worker expires.
    #[serde(default = "default_liveness_budget")]
    pub liveness_budget: u32,

    /// Extra seconds past expiry before eviction, for late heartbeats on
    /// slow links.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    /// Capacity of the bounded internal channels.
    #[serde(default = "default_broker_channel_capacity")]
    pub channel_capacity: usize,

    /// Optional Curve key material passed to the socket layer.
    pub curve: Option<CurveKeys>,
}

fn default_endpoint() -> String {
    "tcp://127.0.0.1:5570".into()
}

fn default_heartbeat_ms() -> u64 {
    2500
}

fn default_liveness_budget() -> u32 {
    10
}

fn default_grace_secs() -> u64 {
    30
}

fn default_broker_channel_capacity() -> usize {
    200
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            heartbeat_ms: default_heartbeat_ms(),
            liveness_budget: default_liveness_budget(),
            grace_secs: default_grace_secs(),
            channel_capacity: default_broker_channel_capacity(),
            curve: None,
        }
    }
}

impl BrokerSettings {
    pub fn transport(&self) -> Transport {
        Transport::parse(&self.endpoint)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    /// Time a worker record stays fresh after a ping:
    /// `heartbeat × liveness_budget`.
    pub fn expiry_window(&self) -> Duration {
        self.heartbeat_interval() * self.liveness_budget
    }
}

// ── Worker section ──────────────────────────────────────────────────

/// Worker section: heartbeat cadence and reconnection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Nominal heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Unanswered heartbeats tolerated before forcing a reconnect.
    #[serde(default = "default_liveness_budget")]
    pub liveness_budget: u32,

    /// Initial-connect attempts before surfacing failure.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Linear backoff base for initial connect, in milliseconds.
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,

    /// Exponential reconnect backoff base, in seconds.
    #[serde(default = "default_reconnect_base_secs")]
    pub reconnect_base_secs: u64,

    /// Exponential reconnect backoff cap, in seconds.
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,

    /// Capacity of the bounded reply channel.
    #[serde(default = "default_peer_channel_capacity")]
    pub channel_capacity: usize,

    /// Optional Curve public key of the broker.
    pub curve: Option<CurveKeys>,
}

fn default_connect_attempts() -> u32 {
    10
}

fn default_connect_backoff_ms() -> u64 {
    250
}

fn default_reconnect_base_secs() -> u64 {
    5
}

fn default_reconnect_max_secs() -> u64 {
    60
}

fn default_peer_channel_capacity() -> usize {
    100
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            liveness_budget: default_liveness_budget(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
            reconnect_base_secs: default_reconnect_base_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
            channel_capacity: default_peer_channel_capacity(),
            curve: None,
        }
    }
}

impl WorkerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_secs(self.reconnect_base_secs)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }
}

// ── Client section ──────────────────────────────────────────────────

/// Client section: timeout, retry, and correlation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Default synchronous request timeout, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries for synchronous requests on timeout or send failure.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Lifetime of nonce correlation entries, in seconds.
    #[serde(default = "default_nonce_expiry_secs")]
    pub nonce_expiry_secs: u64,

    /// Capacity of the bounded send channel.
    #[serde(default = "default_peer_channel_capacity")]
    pub channel_capacity: usize,

    /// Number of latency samples in the rolling window.
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,

    /// Optional Curve public key of the broker.
    pub curve: Option<CurveKeys>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

fn default_nonce_expiry_secs() -> u64 {
    5
}

fn default_latency_window() -> usize {
    100
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            nonce_expiry_secs: default_nonce_expiry_secs(),
            channel_capacity: default_peer_channel_capacity(),
            latency_window: default_latency_window(),
            curve: None,
        }
    }
}

impl ClientSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn nonce_expiry(&self) -> Duration {
        Duration::from_secs(self.nonce_expiry_secs)
    }
}

// ── Loading, overrides, validation ──────────────────────────────────

impl DrehscheibeConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, DrehscheibeError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DrehscheibeError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `DREHSCHEIBE_SECTION_KEY` overrides `section.key`.
    /// Examples:
    /// - `DREHSCHEIBE_BROKER_ENDPOINT` -> `broker.endpoint`
    /// - `DREHSCHEIBE_BROKER_HEARTBEAT_MS` -> `broker.heartbeat_ms`
    /// - `DREHSCHEIBE_CLIENT_TIMEOUT_SECS` -> `client.timeout_secs`
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DREHSCHEIBE_BROKER_ENDPOINT") {
            self.broker.endpoint = v;
        }
        if let Ok(v) = std::env::var("DREHSCHEIBE_BROKER_HEARTBEAT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                self.broker.heartbeat_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("DREHSCHEIBE_BROKER_LIVENESS_BUDGET") {
            if let Ok(n) = v.parse::<u32>() {
                self.broker.liveness_budget = n;
            }
        }
        if let Ok(v) = std::env::var("DREHSCHEIBE_BROKER_GRACE_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.broker.grace_secs = n;
            }
        }
        if let Ok(v) = std::env::var("DREHSCHEIBE_WORKER_HEARTBEAT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                self.worker.heartbeat_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("DREHSCHEIBE_CLIENT_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.client.timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("DREHSCHEIBE_CLIENT_RETRIES") {
            if let Ok(n) = v.parse::<u32>() {
                self.client.retries = n;
            }
        }
    }

    /// Validate the config: non-zero intervals, sane backoff ordering.
    pub fn validate(&self) -> Result<(), DrehscheibeError> {
        if self.broker.heartbeat_ms == 0 || self.worker.heartbeat_ms == 0 {
            return Err(DrehscheibeError::Config(
                "heartbeat interval must be non-zero".into(),
            ));
        }
        if self.broker.liveness_budget == 0 || self.worker.liveness_budget == 0 {
            return Err(DrehscheibeError::Config(
                "liveness budget must be non-zero".into(),
            ));
        }
        if self.worker.reconnect_max_secs < self.worker.reconnect_base_secs {
            return Err(DrehscheibeError::Config(format!(
                "reconnect cap {}s is below base {}s",
                self.worker.reconnect_max_secs, self.worker.reconnect_base_secs
            )));
        }
        if self.worker.connect_attempts == 0 {
            return Err(DrehscheibeError::Config(
                "connect attempts must be non-zero".into(),
            ));
        }
        if self.broker.channel_capacity == 0
            || self.worker.channel_capacity == 0
            || self.client.channel_capacity == 0
        {
            return Err(DrehscheibeError::Config(
                "channel capacity must be non-zero".into(),
            ));
        }
        if self.client.latency_window == 0 {
            return Err(DrehscheibeError::Config(
                "latency window must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = DrehscheibeConfig::default();
        assert_eq!(cfg.broker.heartbeat_ms, 2500);
        assert_eq!(cfg.broker.liveness_budget, 10);
        assert_eq!(cfg.broker.grace_secs, 30);
        assert_eq!(cfg.worker.reconnect_base_secs, 5);
        assert_eq!(cfg.worker.reconnect_max_secs, 60);
        assert_eq!(cfg.worker.connect_attempts, 10);
        assert_eq!(cfg.worker.connect_backoff_ms, 250);
        assert_eq!(cfg.client.timeout_secs, 30);
        assert_eq!(cfg.client.retries, 3);
        assert_eq!(cfg.client.nonce_expiry_secs, 5);
        assert_eq!(cfg.client.latency_window, 100);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn expiry_window_scales_with_liveness() {
        let cfg = BrokerSettings::default();
        assert_eq!(cfg.expiry_window(), Duration::from_millis(25_000));
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let cfg = DrehscheibeConfig::from_toml(
            r#"
            [broker]
            endpoint = "tcp://0.0.0.0:6000"
            heartbeat_ms = 1000

            [client]
            retries = 1
            "#,
        )
        .unwrap();
        assert_eq!(cfg.broker.endpoint, "tcp://0.0.0.0:6000");
        assert_eq!(cfg.broker.heartbeat_ms, 1000);
        assert_eq!(cfg.broker.liveness_budget, 10);
        assert_eq!(cfg.client.retries, 1);
        assert_eq!(cfg.worker.heartbeat_ms, 2500);
    }

    #[test]
    fn parses_curve_section() {
        let cfg = DrehscheibeConfig::from_toml(
            r#"
            [broker]
            endpoint = "tcp://0.0.0.0:6000"

            [broker.curve]
            public_key = "pub-abc"
            secret_key = "sec-def"

            [client.curve]
            public_key = "pub-abc"
            "#,
        )
        .unwrap();
        let broker_curve = cfg.broker.curve.unwrap();
        assert_eq!(broker_curve.public_key, "pub-abc");
        assert_eq!(broker_curve.secret_key.as_deref(), Some("sec-def"));
        assert!(cfg.client.curve.unwrap().secret_key.is_none());
    }

    #[test]
    fn rejects_zero_heartbeat() {
        let err = DrehscheibeConfig::from_toml(
            r#"
            [broker]
            heartbeat_ms = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("heartbeat"));
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let err = DrehscheibeConfig::from_toml(
            r#"
            [worker]
            reconnect_base_secs = 90
            reconnect_max_secs = 60
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("reconnect cap"));
    }
}
