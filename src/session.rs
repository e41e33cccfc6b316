// Per-request session bookkeeping
use crate::error::ProxyError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// One downstream request, from head parse to relay completion.
#[derive(Debug)]
pub struct ProxySession {
    pub peer: SocketAddr,
    pub method: String,
    /// Absolute URL for HTTP, `host:port` for CONNECT.
    pub target: String,
    pub started: Instant,
    pub deadline: Instant,
}

impl ProxySession {
    pub fn new(peer: SocketAddr, method: &str, target: &str, total_timeout: Duration) -> Self {
        let started = Instant::now();
        ProxySession {
            peer,
            method: method.to_string(),
            target: target.to_string(),
            started,
            deadline: started + total_timeout,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_tunnel(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Emits the outcome line for this session.
    pub fn finish(self, status: Option<u16>, error: Option<&ProxyError>) {
        let elapsed_ms = self.elapsed().as_millis() as u64;
        match error {
            None => tracing::info!(
                peer = %self.peer,
                method = %self.method,
                target = %self.target,
                status = status.unwrap_or(0),
                elapsed_ms,
                "Session completed"
            ),
            Some(e) => tracing::warn!(
                peer = %self.peer,
                method = %self.method,
                target = %self.target,
                status = status.unwrap_or(0),
                elapsed_ms,
                kind = e.kind(),
                error = %e,
                "Session failed"
            ),
        }
    }
}
