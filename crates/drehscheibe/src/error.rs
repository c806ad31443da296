use thiserror::Error;

/// Errors that can occur in the drehscheibe messaging layer.
#[derive(Debug, Error)]
pub enum DrehscheibeError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("request timeout")]
    Timeout,

    #[error("service error: {0}")]
    Service(String),

    #[error("no handler configured for service '{0}'")]
    NoHandler(String),

    #[error("connect to {endpoint} failed after {attempts} attempts: {last}")]
    Connect {
        endpoint: String,
        attempts: u32,
        last: String,
    },

    #[error("shutting down")]
    Shutdown,

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}
