// Scripted upstream NTLM proxy for integration tests
#![allow(dead_code, clippy::unwrap_used)]

use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use ntlm_bridge::http::{self, BodyReader, RequestHead, MAX_HEADER_SIZE};
use ntlm_bridge::{Config, ProxyServer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

pub const USER: &str = "alice";
pub const PASSWORD: &str = "Passw0rd!";
pub const DOMAIN: &str = "CORP";
pub const SERVER_CHALLENGE: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
pub const SLOW_REPLY: Duration = Duration::from_millis(700);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Full three-leg NTLM exchange.
    Ntlm,
    /// Like `Ntlm`, but closes the connection after the first bare 407.
    NtlmCloseAfterFirst,
    /// Never challenges.
    Open,
    /// Like `Open`, but ignores `Expect: 100-continue`.
    OpenNoContinue,
    /// Like `Open`, but answers after `SLOW_REPLY`.
    OpenSlow,
    /// Like `Ntlm`, but answers the authenticated request after `SLOW_REPLY`.
    NtlmSlowFinal,
    /// Answers every Type-3 with another 407.
    RejectCredentials,
    /// Offers only Basic.
    BasicOnly,
    /// Accepts connections and never answers.
    Silent,
    /// Authenticates, then refuses CONNECT with 403.
    RefuseConnect,
}

impl Mode {
    fn is_open(self) -> bool {
        matches!(self, Mode::Open | Mode::OpenNoContinue | Mode::OpenSlow)
    }

    fn is_slow(self) -> bool {
        matches!(self, Mode::OpenSlow | Mode::NtlmSlowFinal)
    }
}

/// A request the fake accepted as authenticated (or any request in `Open` mode).
#[derive(Debug, Clone)]
pub struct Recorded {
    pub head: RequestHead,
    pub body: Vec<u8>,
}

#[derive(Default)]
pub struct Log {
    pub final_requests: Mutex<Vec<Recorded>>,
    /// Every head received, in order, including handshake rounds.
    pub all_heads: Mutex<Vec<RequestHead>>,
    pub connections: AtomicUsize,
    pub type3_valid: Mutex<Vec<bool>>,
    /// Signalled when a tunnel's upstream side sees the bridge close it.
    pub tunnel_closed: Notify,
}

pub struct FakeUpstream {
    pub addr: SocketAddr,
    pub log: Arc<Log>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl FakeUpstream {
    pub async fn start(mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Log::default());
        let shared = Arc::clone(&log);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                shared.connections.fetch_add(1, Ordering::SeqCst);
                let log = Arc::clone(&shared);
                tokio::spawn(async move {
                    let _ = serve(stream, mode, log).await;
                });
            }
        });
        FakeUpstream { addr, log, handle }
    }

    pub fn connections(&self) -> usize {
        self.log.connections.load(Ordering::SeqCst)
    }

    pub fn final_requests(&self) -> Vec<Recorded> {
        self.log.final_requests.lock().unwrap().clone()
    }

    pub fn all_heads(&self) -> Vec<RequestHead> {
        self.log.all_heads.lock().unwrap().clone()
    }

    pub fn type3_results(&self) -> Vec<bool> {
        self.log.type3_valid.lock().unwrap().clone()
    }
}

async fn serve(stream: TcpStream, mode: Mode, log: Arc<Log>) -> std::io::Result<()> {
    let mut conn = BufReader::new(stream);
    if mode == Mode::Silent {
        tokio::time::sleep(Duration::from_secs(30)).await;
        return Ok(());
    }

    loop {
        let Ok(Some(raw)) = http::read_head(&mut conn, MAX_HEADER_SIZE).await else {
            return Ok(());
        };
        let head = RequestHead::parse(&raw).unwrap();
        log.all_heads.lock().unwrap().push(head.clone());

        let token = head
            .headers
            .get("Proxy-Authorization")
            .and_then(|v| v.strip_prefix("NTLM "))
            .map(|t| base64::engine::general_purpose::STANDARD.decode(t).unwrap());
        let message_type = token
            .as_ref()
            .map(|t| u32::from_le_bytes([t[8], t[9], t[10], t[11]]));

        // An unauthenticated request that asked first gets its 407 without the body.
        let expects = head.headers.has_token("Expect", "100-continue");
        let declined = expects && !mode.is_open() && message_type.is_none();
        if expects && !declined && mode != Mode::OpenNoContinue {
            conn.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
        }
        let mut body = Vec::new();
        if !declined {
            let mut reader = BodyReader::new(head.body_framing().unwrap());
            while let Some(chunk) = reader.next_chunk(&mut conn).await? {
                body.extend_from_slice(&chunk);
            }
        }

        let authenticated = match (mode, message_type) {
            _ if mode.is_open() => true,
            (Mode::BasicOnly, _) => {
                conn.write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"corp\"\r\nContent-Length: 0\r\n\r\n",
                )
                .await?;
                if declined {
                    return Ok(());
                }
                continue;
            }
            (_, None) => {
                let close = mode == Mode::NtlmCloseAfterFirst || declined;
                let reply = format!(
                    "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM\r\nProxy-Authenticate: Basic realm=\"corp\"\r\nContent-Length: 13\r\n{}\r\naccess denied",
                    if close { "Connection: close\r\n" } else { "" }
                );
                conn.write_all(reply.as_bytes()).await?;
                if close {
                    return Ok(());
                }
                continue;
            }
            (_, Some(1)) => {
                let challenge = base64::engine::general_purpose::STANDARD.encode(challenge_message());
                let reply = format!(
                    "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM {}\r\nContent-Length: 0\r\n\r\n",
                    challenge
                );
                conn.write_all(reply.as_bytes()).await?;
                continue;
            }
            (_, Some(3)) => {
                let valid = verify_authenticate(token.as_deref().unwrap_or_default());
                log.type3_valid.lock().unwrap().push(valid);
                if mode == Mode::RejectCredentials || !valid {
                    conn.write_all(
                        b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM\r\nContent-Length: 0\r\n\r\n",
                    )
                    .await?;
                    continue;
                }
                true
            }
            (_, Some(_)) => false,
        };

        if !authenticated {
            conn.write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                .await?;
            return Ok(());
        }

        log.final_requests.lock().unwrap().push(Recorded {
            head: head.clone(),
            body: body.clone(),
        });

        if head.is_connect() {
            if mode == Mode::RefuseConnect {
                conn.write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                    .await?;
                return Ok(());
            }
            conn.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await?;
            let result = echo(conn).await;
            log.tunnel_closed.notify_one();
            return result;
        }

        if mode.is_slow() {
            tokio::time::sleep(SLOW_REPLY).await;
        }

        let reply_body = if body.is_empty() {
            format!("hello from {}", head.target)
        } else {
            format!("received {} bytes", body.len())
        };
        let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nProxy-Connection: keep-alive\r\nConnection: keep-alive\r\nX-Upstream: fake\r\n\r\n{}",
            reply_body.len(),
            reply_body
        );
        conn.write_all(reply.as_bytes()).await?;
    }
}

async fn echo(mut conn: BufReader<TcpStream>) -> std::io::Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        conn.get_mut().write_all(&buf[..n]).await?;
    }
}

/// Type-2 message with a target name and an MsvAvTimestamp.
pub fn challenge_message() -> Vec<u8> {
    let target_name: Vec<u8> = DOMAIN.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    let mut info = Vec::new();
    // MsvAvNbDomainName
    info.extend_from_slice(&2u16.to_le_bytes());
    info.extend_from_slice(&(target_name.len() as u16).to_le_bytes());
    info.extend_from_slice(&target_name);
    // MsvAvTimestamp
    info.extend_from_slice(&7u16.to_le_bytes());
    info.extend_from_slice(&8u16.to_le_bytes());
    info.extend_from_slice(&0x01d9_0000_0000_0000u64.to_le_bytes());
    // MsvAvEOL
    info.extend_from_slice(&[0, 0, 0, 0]);

    let flags: u32 = 0x0000_0001 | 0x0000_0200 | 0x0008_0000 | 0x0080_0000 | 0x2000_0000;
    let name_offset = 48u32;
    let info_offset = name_offset + target_name.len() as u32;

    let mut msg = Vec::new();
    msg.extend_from_slice(b"NTLMSSP\0");
    msg.extend_from_slice(&2u32.to_le_bytes());
    push_field(&mut msg, target_name.len(), name_offset);
    msg.extend_from_slice(&flags.to_le_bytes());
    msg.extend_from_slice(&SERVER_CHALLENGE);
    msg.extend_from_slice(&[0u8; 8]);
    push_field(&mut msg, info.len(), info_offset);
    msg.extend_from_slice(&target_name);
    msg.extend_from_slice(&info);
    msg
}

fn push_field(msg: &mut Vec<u8>, len: usize, offset: u32) {
    msg.extend_from_slice(&(len as u16).to_le_bytes());
    msg.extend_from_slice(&(len as u16).to_le_bytes());
    msg.extend_from_slice(&offset.to_le_bytes());
}

fn field(msg: &[u8], at: usize) -> &[u8] {
    let len = u16::from_le_bytes([msg[at], msg[at + 1]]) as usize;
    let offset = u32::from_le_bytes([msg[at + 4], msg[at + 5], msg[at + 6], msg[at + 7]]) as usize;
    &msg[offset..offset + len]
}

fn utf16(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).unwrap()
}

/// Recomputes NTProofStr from the known password and compares.
fn verify_authenticate(msg: &[u8]) -> bool {
    if msg.len() < 64 {
        return false;
    }
    let nt_response = field(msg, 20);
    let domain = utf16(field(msg, 28));
    let user = utf16(field(msg, 36));
    if nt_response.len() <= 16 || user != USER || domain != DOMAIN {
        return false;
    }

    let key = ntlm_bridge::ntlm::ntowf_v2(PASSWORD, &user, &domain).unwrap();
    let mut mac = Hmac::<Md5>::new_from_slice(&key[..]).unwrap();
    mac.update(&SERVER_CHALLENGE);
    mac.update(&nt_response[16..]);
    mac.finalize().into_bytes().as_slice() == &nt_response[..16]
}

pub fn config_for(upstream: SocketAddr) -> Config {
    Config {
        listen_addr: "127.0.0.1:0".to_string(),
        upstream_host: upstream.ip().to_string(),
        upstream_port: upstream.port(),
        upstream_username: format!("{}\\{}", DOMAIN, USER),
        upstream_password: PASSWORD.to_string(),
        connect_timeout_ms: 2_000,
        total_timeout_ms: 10_000,
        idle_timeout_seconds: 5,
        ..Config::default()
    }
}

pub async fn start_bridge(config: Config) -> (ProxyServer, SocketAddr) {
    let mut server = ProxyServer::new(config);
    let addr = server.start().await.unwrap();
    (server, addr)
}

/// Sends raw bytes to the bridge and reads until it closes the connection.
pub async fn raw_exchange(bridge: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(bridge).await.unwrap();
    // The bridge may reject and close before reading everything.
    let _ = stream.write_all(request).await;
    let mut out = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut out)).await;
    assert!(read.is_ok(), "bridge did not close the connection");
    String::from_utf8_lossy(&out).into_owned()
}
