// NTLM-authenticating forward proxy library

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod ntlm;
pub mod proxy;
pub mod relay;
pub mod session;
pub mod tunnel;
pub mod upstream;

pub use auth::UpstreamCredentials;
pub use config::Config;
pub use error::{ProxyError, Result};
pub use proxy::ProxyServer;
pub use upstream::{Connector, NtlmConnector, UpstreamChannel, UpstreamRequest};
