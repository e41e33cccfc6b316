// Downstream proxy listener and request dispatch
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::http::{self, HeadError, RequestHead, MAX_HEADER_SIZE, REQUEST_HOP_HEADERS};
use crate::relay;
use crate::session::ProxySession;
use crate::tunnel;
use crate::upstream::{Connector, NtlmConnector};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};

pub struct ProxyServer {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    local_addr: Option<SocketAddr>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ProxyServer {
    pub fn new(config: Config) -> Self {
        let connector = Arc::new(NtlmConnector::from_config(&config));
        Self::with_connector(config, connector)
    }

    /// Server whose upstream leg goes through `connector`.
    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Self {
        ProxyServer {
            config: Arc::new(config),
            connector,
            local_addr: None,
            server_handle: None,
        }
    }

    /// Binds the listener and spawns the accept loop. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.server_handle.is_some() {
            self.stop().await?;
        }

        let addr = self.config.listen_socket_addr()?;
        let listener = TcpListener::bind(addr).await.map_err(|e| ProxyError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr()?;

        tracing::info!(
            "Proxy listening on {}, upstream {}",
            local_addr,
            self.config.upstream_addr()
        );

        let config = Arc::clone(&self.config);
        let connector = Arc::clone(&self.connector);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, client_addr)) => {
                        tracing::debug!("New connection from {}", client_addr);
                        let config = Arc::clone(&config);
                        let connector = Arc::clone(&connector);
                        tokio::spawn(async move {
                            handle_connection(stream, client_addr, config, connector).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
        });

        self.local_addr = Some(local_addr);
        self.server_handle = Some(handle);
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stops accepting. Sessions already running finish on their own.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
            let _ = handle.await;
            tracing::info!("Proxy server stopped");
        }
        self.local_addr = None;
        Ok(())
    }

    /// Serves until `shutdown` resolves.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        tracing::info!("Shutdown requested");
        self.stop().await
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
) {
    let _ = stream.set_nodelay(true);
    let mut conn = BufReader::new(stream);

    let head = match read_request(&mut conn, &config).await {
        Ok(Some(head)) => head,
        Ok(None) => {
            tracing::debug!("{} closed without sending a request", peer);
            return;
        }
        Err(e) => {
            tracing::warn!(peer = %peer, kind = e.kind(), error = %e, "Rejected request");
            let _ = relay::write_error(&mut conn, &e).await;
            return;
        }
    };

    let target = match session_target(&head) {
        Ok(target) => target,
        Err(e) => {
            tracing::warn!(peer = %peer, kind = e.kind(), error = %e, "Rejected request");
            let _ = relay::write_error(&mut conn, &e).await;
            return;
        }
    };
    let session = ProxySession::new(peer, &head.method, &target, config.total_timeout());
    tracing::debug!("{} {} from {}", session.method, session.target, peer);

    match dispatch(connector.as_ref(), &config, &session, head, &mut conn).await {
        Ok(status) => session.finish(Some(status), None),
        Err(e) => {
            let status = relay::write_error(&mut conn, &e).await.ok().flatten();
            session.finish(status, Some(&e));
        }
    }
}

/// Reads and parses the request head. `None` when the client went away or
/// stayed idle before sending anything.
async fn read_request(
    conn: &mut BufReader<TcpStream>,
    config: &Config,
) -> Result<Option<RequestHead>> {
    let raw = match tokio::time::timeout(
        config.idle_timeout(),
        http::read_head(conn, MAX_HEADER_SIZE),
    )
    .await
    {
        Err(_) => return Ok(None),
        Ok(Ok(None)) => return Ok(None),
        Ok(Ok(Some(raw))) => raw,
        Ok(Err(HeadError::TooLarge)) => {
            return Err(ProxyError::HeaderTooLarge {
                limit: MAX_HEADER_SIZE,
            })
        }
        Ok(Err(HeadError::Truncated)) => {
            return Err(ProxyError::ClientProtocol("truncated request head".to_string()))
        }
        Ok(Err(HeadError::Io(e))) => return Err(ProxyError::Io(e)),
    };
    RequestHead::parse(&raw)
        .map(Some)
        .map_err(ProxyError::ClientProtocol)
}

/// Routes one request to the tunnel or HTTP relay.
async fn dispatch(
    connector: &dyn Connector,
    config: &Config,
    session: &ProxySession,
    mut head: RequestHead,
    conn: &mut BufReader<TcpStream>,
) -> Result<u16> {
    if session.is_tunnel() {
        return tunnel::relay_tunnel(connector, session, conn, config.idle_timeout()).await;
    }

    check_plain_http(config, &head.target)?;
    let authority = absolute_authority(&head.target).ok_or_else(|| {
        ProxyError::ClientProtocol(format!("expected an absolute URL, got {:?}", head.target))
    })?;

    head.headers.strip(REQUEST_HOP_HEADERS);
    if !head.headers.contains("Host") {
        head.headers.append("Host", authority);
    }
    relay::relay_http(connector, session, head, conn).await
}

fn session_target(head: &RequestHead) -> Result<String> {
    if head.is_connect() {
        extract_connect_host(head)
    } else {
        Ok(head.target.clone())
    }
}

fn check_plain_http(config: &Config, target: &str) -> Result<()> {
    if config.allow_plain_http || scheme_of(target).is_some_and(|s| s.eq_ignore_ascii_case("https")) {
        return Ok(());
    }
    Err(ProxyError::Policy("plain HTTP disallowed by policy".to_string()))
}

fn scheme_of(target: &str) -> Option<&str> {
    let (scheme, _) = target.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}

/// Authority component of an absolute-form URL.
fn absolute_authority(target: &str) -> Option<String> {
    scheme_of(target)?;
    let (_, rest) = target.split_once("://")?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    (!authority.is_empty()).then(|| authority.to_string())
}

// host:port from the CONNECT request target, falling back to Host
fn extract_connect_host(head: &RequestHead) -> Result<String> {
    let target = if head.target.is_empty() {
        head.headers.get("Host").unwrap_or_default()
    } else {
        head.target.as_str()
    };

    let valid = target
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p > 0));
    if !valid {
        return Err(ProxyError::ClientProtocol(format!(
            "CONNECT target must be host:port, got {:?}",
            target
        )));
    }
    Ok(target.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn connect_head(raw: &[u8]) -> RequestHead {
        RequestHead::parse(raw).unwrap()
    }

    #[test]
    fn test_extract_connect_host() {
        let head = connect_head(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n");
        assert_eq!(extract_connect_host(&head).unwrap(), "example.com:443");

        let head = connect_head(b"CONNECT [::1]:8443 HTTP/1.1\r\n\r\n");
        assert_eq!(extract_connect_host(&head).unwrap(), "[::1]:8443");
    }

    #[test]
    fn test_extract_connect_host_requires_port() {
        let head = connect_head(b"CONNECT example.com HTTP/1.1\r\n\r\n");
        assert!(matches!(
            extract_connect_host(&head),
            Err(ProxyError::ClientProtocol(_))
        ));
        let head = connect_head(b"CONNECT example.com:0 HTTP/1.1\r\n\r\n");
        assert!(extract_connect_host(&head).is_err());
    }

    #[test]
    fn test_absolute_authority() {
        assert_eq!(
            absolute_authority("http://example.com/a?b").as_deref(),
            Some("example.com")
        );
        assert_eq!(
            absolute_authority("http://user@example.com:8080").as_deref(),
            Some("example.com:8080")
        );
        assert_eq!(absolute_authority("/relative"), None);
        assert_eq!(absolute_authority("http:///nohost"), None);
    }

    #[test]
    fn test_plain_http_policy() {
        let mut config = Config::default();
        assert!(check_plain_http(&config, "http://example.com/").is_ok());

        config.allow_plain_http = false;
        assert!(matches!(
            check_plain_http(&config, "http://example.com/"),
            Err(ProxyError::Policy(_))
        ));
        assert!(check_plain_http(&config, "https://example.com/").is_ok());
    }
}
