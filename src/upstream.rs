// Upstream connector, one authenticated upstream connection per session

use crate::auth::{Handshake, Phase, Step, UpstreamCredentials};
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::http::{
    self, BodyReader, Framing, HeadError, RequestHead, ResponseHead, MAX_HEADER_SIZE,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Byte stream an upstream leg runs over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Buffered upstream connection. The buffer may already hold bytes that
/// follow the last head read from it.
pub type UpstreamIo = BufReader<Box<dyn Transport>>;

/// Request body still sitting on the downstream connection.
pub struct RequestBody<'a> {
    pub reader: BodyReader,
    pub source: &'a mut (dyn AsyncBufRead + Unpin + Send),
}

pub enum UpstreamRequest<'a> {
    /// Plain HTTP exchange. `head` is already stripped of downstream hop headers.
    Http {
        head: RequestHead,
        body: Option<RequestBody<'a>>,
        deadline: Instant,
    },
    /// `CONNECT authority`.
    Tunnel { authority: String },
}

pub enum UpstreamChannel {
    Http(UpstreamResponse),
    Tunnel(TunnelStream),
}

/// Response head plus a pull-based cursor over its body.
pub struct UpstreamResponse {
    pub head: ResponseHead,
    body: BodyReader,
    io: UpstreamIo,
}

impl UpstreamResponse {
    pub fn new(head: ResponseHead, framing: Framing, io: UpstreamIo) -> Self {
        UpstreamResponse {
            head,
            body: BodyReader::new(framing),
            io,
        }
    }

    pub fn framing(&self) -> Framing {
        self.body.framing()
    }

    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        self.body.next_chunk(&mut self.io).await
    }
}

/// Established tunnel through the upstream proxy.
pub struct TunnelStream {
    io: UpstreamIo,
}

impl TunnelStream {
    pub fn new(io: UpstreamIo) -> Self {
        TunnelStream { io }
    }

    pub fn into_inner(self) -> UpstreamIo {
        self.io
    }
}

/// Opens an authenticated channel through the upstream proxy.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: UpstreamRequest<'_>) -> Result<UpstreamChannel>;
}

/// Which error a missed deadline turns into.
#[derive(Clone, Copy)]
struct Deadline {
    at: Instant,
    establishing: bool,
}

/// Dedicated NTLM-aware transport to the upstream proxy.
pub struct NtlmConnector {
    addr: String,
    credentials: Arc<UpstreamCredentials>,
    connect_timeout: Duration,
}

impl NtlmConnector {
    pub fn new(addr: String, credentials: Arc<UpstreamCredentials>, connect_timeout: Duration) -> Self {
        NtlmConnector {
            addr,
            credentials,
            connect_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.upstream_addr(),
            Arc::new(config.credentials()),
            config.connect_timeout(),
        )
    }

    async fn dial(&self, deadline: Instant) -> Result<UpstreamIo> {
        let stream = match timeout_at(deadline, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ProxyError::Connect {
                    addr: self.addr.clone(),
                    source: e,
                })
            }
            Err(_) => return Err(self.timeout_error(true)),
        };
        let _ = stream.set_nodelay(true);
        debug!("Connected to upstream proxy {}", self.addr);
        Ok(BufReader::new(Box::new(stream) as Box<dyn Transport>))
    }

    fn timeout_error(&self, establishing: bool) -> ProxyError {
        if establishing {
            ProxyError::ConnectTimeout {
                addr: self.addr.clone(),
            }
        } else {
            ProxyError::Timeout
        }
    }

    async fn bounded<T, F>(&self, deadline: Deadline, fut: F) -> Result<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match timeout_at(deadline.at, fut).await {
            Ok(result) => result.map_err(ProxyError::Io),
            Err(_) => Err(self.timeout_error(deadline.establishing)),
        }
    }

    async fn read_head(&self, io: &mut UpstreamIo, deadline: Deadline) -> Result<ResponseHead> {
        let raw = match timeout_at(deadline.at, http::read_head(io, MAX_HEADER_SIZE)).await {
            Err(_) => return Err(self.timeout_error(deadline.establishing)),
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => {
                return Err(ProxyError::UpstreamProtocol(
                    "upstream closed the connection without responding".to_string(),
                ))
            }
            Ok(Err(HeadError::TooLarge)) => {
                return Err(ProxyError::UpstreamProtocol("response head too large".to_string()))
            }
            Ok(Err(HeadError::Truncated)) => {
                return Err(ProxyError::UpstreamProtocol("truncated response head".to_string()))
            }
            Ok(Err(HeadError::Io(e))) => return Err(ProxyError::Io(e)),
        };
        ResponseHead::parse(&raw).map_err(ProxyError::UpstreamProtocol)
    }

    async fn read_response(&self, io: &mut UpstreamIo, deadline: Deadline) -> Result<ResponseHead> {
        loop {
            let head = self.read_head(io, deadline).await?;
            if head.is_interim() {
                debug!(status = head.status, "Skipping interim upstream response");
                continue;
            }
            return Ok(head);
        }
    }

    /// Waits for `100 Continue` after a head sent with `Expect: 100-continue`.
    ///
    /// Returns `None` when the body should follow: on `100`, or when the
    /// upstream stays silent until `deadline`. A final status answered
    /// before the body is returned as is.
    async fn await_continue(&self, io: &mut UpstreamIo, deadline: Deadline) -> Result<Option<ResponseHead>> {
        loop {
            let head = match self.read_head(io, deadline).await {
                Ok(head) => head,
                Err(ProxyError::ConnectTimeout { .. }) | Err(ProxyError::Timeout) => {
                    debug!("No 100 Continue from upstream, sending the body anyway");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            if head.status == 100 {
                return Ok(None);
            }
            if head.is_interim() {
                debug!(status = head.status, "Skipping interim upstream response");
                continue;
            }
            return Ok(Some(head));
        }
    }

    /// Consumes a challenge response's body so the connection can carry the
    /// next round. Returns whether the connection is still usable.
    async fn finish_round(
        &self,
        io: &mut UpstreamIo,
        head: &ResponseHead,
        framing: Framing,
        deadline: Deadline,
    ) -> Result<bool> {
        if framing == Framing::UntilClose || head.closes_connection() {
            return Ok(false);
        }
        let mut body = BodyReader::new(framing);
        self.bounded(deadline, body.drain(io)).await?;
        Ok(true)
    }

    /// Decides what to do when the upstream will not keep the connection:
    /// before the negotiate round a fresh connection is fine, afterwards the
    /// NTLM state is lost.
    async fn reconnect(&self, handshake: &Handshake<'_>, deadline: Deadline) -> Result<UpstreamIo> {
        if handshake.phase() == Phase::NegotiateSent {
            debug!("Upstream closed after the first challenge, redialling for negotiate");
            return self.dial(deadline.at).await;
        }
        Err(ProxyError::Auth(
            "upstream closed the connection during the NTLM exchange".to_string(),
        ))
    }

    async fn open_tunnel(&self, authority: &str) -> Result<UpstreamChannel> {
        let deadline = Deadline {
            at: Instant::now() + self.connect_timeout,
            establishing: true,
        };
        let mut io = self.dial(deadline.at).await?;
        let mut handshake = Handshake::new(&self.credentials);
        let mut authorization: Option<String> = None;

        loop {
            let request = connect_request(authority, authorization.as_deref());
            self.bounded(deadline, async {
                io.write_all(&request).await?;
                io.flush().await
            })
            .await?;

            let head = self.read_response(&mut io, deadline).await?;
            let framing = head
                .body_framing("CONNECT")
                .map_err(ProxyError::UpstreamProtocol)?;

            match handshake.observe(head.status, &head.headers) {
                Step::Retry(value) => {
                    if !self.finish_round(&mut io, &head, framing, deadline).await? {
                        io = self.reconnect(&handshake, deadline).await?;
                    }
                    authorization = Some(value);
                }
                Step::Authenticated if (200..300).contains(&head.status) => {
                    debug!(phase = ?handshake.phase(), "Tunnel to {} established upstream", authority);
                    return Ok(UpstreamChannel::Tunnel(TunnelStream::new(io)));
                }
                Step::Authenticated => {
                    return Err(ProxyError::UpstreamRefused {
                        status: head.status,
                    })
                }
                Step::Failed(reason) => return Err(ProxyError::Auth(reason)),
            }
        }
    }

    async fn exchange(
        &self,
        base: RequestHead,
        mut body: Option<RequestBody<'_>>,
        session_deadline: Instant,
    ) -> Result<UpstreamChannel> {
        let establish = Deadline {
            at: session_deadline.min(Instant::now() + self.connect_timeout),
            establishing: true,
        };
        let transfer = Deadline {
            at: session_deadline,
            establishing: false,
        };

        let has_body = body.as_ref().is_some_and(|b| !b.reader.is_done());
        let mut io = self.dial(establish.at).await?;
        let mut handshake = Handshake::new(&self.credentials);
        let mut authorization: Option<String> = None;
        let mut body_sent = false;

        loop {
            let phase = handshake.phase();
            let plan = match phase {
                _ if !has_body => BodyPlan::Inline,
                Phase::Init => BodyPlan::AwaitContinue,
                Phase::AuthenticateSent => BodyPlan::Inline,
                _ => BodyPlan::Withheld,
            };
            let head = attempt_head(&base, authorization.as_deref(), plan, phase);
            // Only the negotiate round is sure to be answered by a challenge.
            let read_deadline = if phase == Phase::NegotiateSent {
                establish
            } else {
                transfer
            };

            let response = match plan {
                BodyPlan::Inline if has_body => {
                    self.bounded(transfer, io.write_all(&head.to_bytes())).await?;
                    if let Some(body) = body.as_mut() {
                        self.send_body(&mut io, body, transfer).await?;
                    }
                    self.bounded(transfer, io.flush()).await?;
                    body_sent = true;
                    self.read_response(&mut io, read_deadline).await?
                }
                BodyPlan::AwaitContinue => {
                    self.write_head(&mut io, &head, establish).await?;
                    match self.await_continue(&mut io, establish).await? {
                        Some(early) => early,
                        None => {
                            if let Some(body) = body.as_mut() {
                                self.send_body(&mut io, body, transfer).await?;
                            }
                            self.bounded(transfer, io.flush()).await?;
                            body_sent = true;
                            self.read_response(&mut io, read_deadline).await?
                        }
                    }
                }
                BodyPlan::Inline | BodyPlan::Withheld => {
                    self.write_head(&mut io, &head, establish).await?;
                    self.read_response(&mut io, read_deadline).await?
                }
            };
            let framing = response
                .body_framing(&base.method)
                .map_err(ProxyError::UpstreamProtocol)?;

            match handshake.observe(response.status, &response.headers) {
                Step::Retry(_) if body_sent => {
                    warn!(status = response.status, "Upstream challenged after the request body was sent");
                    return Err(ProxyError::Auth(
                        "upstream challenged a request whose body was already sent".to_string(),
                    ));
                }
                Step::Retry(value) => {
                    if plan == BodyPlan::AwaitContinue {
                        // The upstream may still be waiting for the body it declined.
                        debug!("Redialling upstream for negotiate after a declined body");
                        io = self.dial(establish.at).await?;
                    } else if !self.finish_round(&mut io, &response, framing, establish).await? {
                        io = self.reconnect(&handshake, establish).await?;
                    }
                    authorization = Some(value);
                }
                Step::Authenticated if plan == BodyPlan::Withheld => {
                    warn!(
                        status = response.status,
                        "Upstream answered a body-withheld round without challenging it"
                    );
                    return Err(ProxyError::Auth(
                        "upstream accepted a request before authentication completed".to_string(),
                    ));
                }
                Step::Authenticated => {
                    return Ok(UpstreamChannel::Http(UpstreamResponse::new(
                        response, framing, io,
                    )));
                }
                Step::Failed(reason) => return Err(ProxyError::Auth(reason)),
            }
        }
    }

    async fn write_head(&self, io: &mut UpstreamIo, head: &RequestHead, deadline: Deadline) -> Result<()> {
        self.bounded(deadline, async {
            io.write_all(&head.to_bytes()).await?;
            io.flush().await
        })
        .await
    }

    async fn send_body(
        &self,
        io: &mut UpstreamIo,
        body: &mut RequestBody<'_>,
        deadline: Deadline,
    ) -> Result<()> {
        let chunked = body.reader.framing() == Framing::Chunked;
        let mut sent = 0u64;
        loop {
            let chunk = match timeout_at(deadline.at, body.reader.next_chunk(&mut *body.source)).await {
                Err(_) => return Err(ProxyError::Timeout),
                Ok(Ok(chunk)) => chunk,
                Ok(Err(e)) => {
                    return Err(ProxyError::ClientProtocol(format!(
                        "request body could not be read: {}",
                        e
                    )))
                }
            };
            let Some(chunk) = chunk else { break };
            sent += chunk.len() as u64;
            if chunked {
                self.bounded(deadline, http::write_chunk(io, &chunk)).await?;
            } else {
                self.bounded(deadline, io.write_all(&chunk)).await?;
            }
        }
        if chunked {
            self.bounded(deadline, io.write_all(http::LAST_CHUNK)).await?;
        }
        debug!(bytes = sent, "Request body forwarded upstream");
        Ok(())
    }
}

#[async_trait]
impl Connector for NtlmConnector {
    async fn connect(&self, request: UpstreamRequest<'_>) -> Result<UpstreamChannel> {
        match request {
            UpstreamRequest::Http {
                head,
                body,
                deadline,
            } => self.exchange(head, body, deadline).await,
            UpstreamRequest::Tunnel { authority } => self.open_tunnel(&authority).await,
        }
    }
}

fn connect_request(authority: &str, authorization: Option<&str>) -> Vec<u8> {
    let mut req = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Connection: Keep-Alive\r\n",
        authority, authority
    );
    if let Some(value) = authorization {
        req.push_str(&format!("Proxy-Authorization: {}\r\n", value));
    }
    req.push_str("\r\n");
    req.into_bytes()
}

/// How a bodied request's body travels on one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyPlan {
    /// No body, or the body follows the head directly.
    Inline,
    /// Body held until the upstream answers `100 Continue`.
    AwaitContinue,
    /// Handshake round announcing an empty body.
    Withheld,
}

/// Request head for one handshake round.
///
/// The first attempt is the request as received. The negotiate round asks
/// the upstream to keep the connection open for the challenge.
fn attempt_head(
    base: &RequestHead,
    authorization: Option<&str>,
    plan: BodyPlan,
    phase: Phase,
) -> RequestHead {
    let mut head = base.clone();
    if let Some(value) = authorization {
        head.headers.set("Proxy-Authorization", value);
    }
    match plan {
        BodyPlan::Inline => {}
        BodyPlan::AwaitContinue => head.headers.set("Expect", "100-continue"),
        BodyPlan::Withheld => {
            head.headers.remove("Transfer-Encoding");
            head.headers.remove("Expect");
            head.headers.set("Content-Length", "0");
        }
    }
    if phase == Phase::NegotiateSent {
        head.headers.set("Proxy-Connection", "Keep-Alive");
        if head.headers.has_token("Connection", "close") {
            head.headers.set("Connection", "keep-alive");
        }
    }
    head
}
