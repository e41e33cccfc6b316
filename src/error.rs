// Error types for the bridge

use thiserror::Error;

/// Errors that can occur while serving a proxy session.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Upstream proxy {addr} unreachable: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Upstream proxy {addr} did not answer within the connect timeout")]
    ConnectTimeout { addr: String },

    /// Never carries credentials or NTLM tokens.
    #[error("Upstream proxy authentication failed: {0}")]
    Auth(String),

    #[error("Upstream proxy refused the tunnel with status {status}")]
    UpstreamRefused { status: u16 },

    #[error("Malformed upstream response: {0}")]
    UpstreamProtocol(String),

    #[error("Malformed client request: {0}")]
    ClientProtocol(String),

    #[error("Request header block exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("Request refused by policy: {0}")]
    Policy(String),

    #[error("Exchange exceeded the total timeout")]
    Timeout,

    #[error("Stream interrupted after response headers were sent: {0}")]
    Stream(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Status line to send downstream, or `None` once nothing more can be sent.
    #[must_use]
    pub fn response_status(&self) -> Option<(u16, &'static str)> {
        match self {
            ProxyError::ClientProtocol(_) => Some((400, "Bad Request")),
            ProxyError::Policy(_) => Some((403, "Forbidden")),
            ProxyError::HeaderTooLarge { .. } => Some((431, "Request Header Fields Too Large")),
            ProxyError::Connect { .. }
            | ProxyError::Auth(_)
            | ProxyError::UpstreamRefused { .. }
            | ProxyError::UpstreamProtocol(_)
            | ProxyError::Io(_) => Some((502, "Bad Gateway")),
            ProxyError::ConnectTimeout { .. } | ProxyError::Timeout => {
                Some((504, "Gateway Timeout"))
            }
            ProxyError::Config(_) | ProxyError::Bind { .. } => {
                Some((500, "Internal Server Error"))
            }
            ProxyError::Stream(_) => None,
        }
    }

    /// Short class name used in session logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "config",
            ProxyError::Bind { .. } => "bind",
            ProxyError::Connect { .. } | ProxyError::ConnectTimeout { .. } => "connect",
            ProxyError::Auth(_) => "auth",
            ProxyError::UpstreamRefused { .. } | ProxyError::UpstreamProtocol(_) => "upstream",
            ProxyError::ClientProtocol(_) | ProxyError::HeaderTooLarge { .. } => "client",
            ProxyError::Policy(_) => "policy",
            ProxyError::Timeout => "timeout",
            ProxyError::Stream(_) => "stream",
            ProxyError::Io(_) => "io",
        }
    }

    /// Body text for the downstream error response. Kept generic on purpose
    /// for auth failures.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            ProxyError::Auth(_) => "Upstream proxy authentication failed".to_string(),
            ProxyError::Connect { .. } => "Upstream proxy unreachable".to_string(),
            ProxyError::ConnectTimeout { .. } | ProxyError::Timeout => {
                "Upstream proxy timed out".to_string()
            }
            ProxyError::Io(_) => "Upstream I/O error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
