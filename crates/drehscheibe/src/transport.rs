use serde::{Deserialize, Serialize};

/// Transport layer for ZeroMQ connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Transport {
    /// Inter-process communication via Unix domain sockets.
    /// Fastest option for same-host deployments.
    Ipc(String),

    /// TCP transport for gateway-to-hub links.
    Tcp { host: String, port: u16 },
}

impl Transport {
    /// Create an IPC transport with the given socket name.
    ///
    /// The name is used as a path component under `/tmp/drehscheibe/`.
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(name.to_string())
    }

    /// Create a TCP transport with the given host and port.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse a ZeroMQ endpoint string (`tcp://host:port` or `ipc://...`).
    ///
    /// Unrecognized strings fall back to TCP on the default broker port so a
    /// bare hostname in config still resolves to something connectable.
    pub fn parse(endpoint: &str) -> Self {
        if let Some(rest) = endpoint.strip_prefix("ipc://") {
            let name = rest
                .rsplit('/')
                .next()
                .unwrap_or(rest)
                .trim_end_matches(".sock");
            return Self::ipc(name);
        }
        if let Some(rest) = endpoint.strip_prefix("tcp://") {
            if let Some((host, port)) = rest.rsplit_once(':') {
                if let Ok(port) = port.parse::<u16>() {
                    return Self::tcp(host, port);
                }
            }
        }
        Self::tcp(endpoint, 5570)
    }

    /// Generate the ZeroMQ endpoint address string.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(name) => format!("ipc:///tmp/drehscheibe/{name}.sock"),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

/// Opaque Curve key material handed to the socket layer at creation time.
///
/// The core never interprets these strings. Peers carry only the broker's
/// public key; the broker additionally holds its secret key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurveKeys {
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_endpoint() {
        let t = Transport::ipc("broker");
        assert_eq!(t.endpoint(), "ipc:///tmp/drehscheibe/broker.sock");
    }

    #[test]
    fn tcp_endpoint() {
        let t = Transport::tcp("127.0.0.1", 5570);
        assert_eq!(t.endpoint(), "tcp://127.0.0.1:5570");
    }

    #[test]
    fn parse_tcp_roundtrip() {
        let t = Transport::parse("tcp://10.0.0.7:6001");
        assert_eq!(t, Transport::tcp("10.0.0.7", 6001));
        assert_eq!(Transport::parse(&t.endpoint()), t);
    }

    #[test]
    fn parse_ipc_roundtrip() {
        let t = Transport::parse("ipc:///tmp/drehscheibe/hub.sock");
        assert_eq!(t, Transport::ipc("hub"));
    }

    #[test]
    fn display_matches_endpoint() {
        let t = Transport::tcp("localhost", 9090);
        assert_eq!(t.to_string(), t.endpoint());
    }
}
