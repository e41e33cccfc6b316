// HTTP/1.1 heads and body framing shared by both legs

use bytes::Bytes;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum total size of a request or response head (64 KiB).
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Maximum number of header fields accepted in one head.
const MAX_HEADERS: usize = 128;

/// Upper bound for a chunk-size or trailer line.
const MAX_LINE: usize = 8 * 1024;

/// Largest chunk handed out by [`BodyReader::next_chunk`].
const READ_CHUNK: usize = 32 * 1024;

/// Downstream-leg headers that never travel upstream.
pub const REQUEST_HOP_HEADERS: &[&str] = &["Proxy-Authorization", "Proxy-Connection"];

/// Upstream-leg headers that never travel downstream.
pub const RESPONSE_HOP_HEADERS: &[&str] = &[
    "Connection",
    "Transfer-Encoding",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Proxy-Connection",
    "Keep-Alive",
];

/// Ordered, case-preserving header collection owned by a single message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name` (case-insensitive).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether any comma-separated value of `name` equals `token`.
    #[must_use]
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Removes every field called `name`. Returns whether any was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    pub fn strip(&mut self, names: &[&str]) {
        for name in names {
            self.remove(name);
        }
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces all fields called `name` with a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    fn from_parsed(raw: &[httparse::Header<'_>]) -> Result<Self, String> {
        let mut headers = Headers::new();
        for h in raw {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| format!("non UTF-8 value for header {}", h.name))?;
            headers.append(h.name, value.trim());
        }
        Ok(headers)
    }

    /// Body framing declared by these headers when a body is expected.
    fn declared_framing(&self) -> Result<Option<Framing>, String> {
        if let Some(te) = self.get_all("Transfer-Encoding").last() {
            let last = te.rsplit(',').next().unwrap_or("").trim();
            if last.eq_ignore_ascii_case("chunked") {
                return Ok(Some(Framing::Chunked));
            }
            return Err(format!("unsupported transfer-encoding: {}", te));
        }

        let mut length: Option<u64> = None;
        for value in self.get_all("Content-Length") {
            for part in value.split(',') {
                let n: u64 = part
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid content-length: {}", value))?;
                if length.is_some_and(|prev| prev != n) {
                    return Err("conflicting content-length values".to_string());
                }
                length = Some(n);
            }
        }

        Ok(length.map(|n| if n == 0 { Framing::Empty } else { Framing::Length(n) }))
    }
}

/// A parsed request line and header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// HTTP/1.x minor version.
    pub version: u8,
    pub headers: Headers,
}

impl RequestHead {
    pub fn parse(buf: &[u8]) -> Result<Self, String> {
        let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut raw);
        match req.parse(buf) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => return Err("incomplete request head".to_string()),
            Err(e) => return Err(format!("invalid request head: {}", e)),
        }

        Ok(RequestHead {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            version: req.version.unwrap_or(1),
            headers: Headers::from_parsed(req.headers)?,
        })
    }

    #[must_use]
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Framing of the request body that follows this head.
    pub fn body_framing(&self) -> Result<Framing, String> {
        if self.is_connect() {
            return Ok(Framing::Empty);
        }
        Ok(self.headers.declared_framing()?.unwrap_or(Framing::Empty))
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// A parsed status line and header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn parse(buf: &[u8]) -> Result<Self, String> {
        let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut raw);
        match resp.parse(buf) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => return Err("incomplete response head".to_string()),
            Err(e) => return Err(format!("invalid response head: {}", e)),
        }

        Ok(ResponseHead {
            version: resp.version.unwrap_or(1),
            status: resp.code.unwrap_or_default(),
            reason: resp.reason.unwrap_or_default().to_string(),
            headers: Headers::from_parsed(resp.headers)?,
        })
    }

    #[must_use]
    pub fn new(status: u16, reason: &str) -> Self {
        ResponseHead {
            version: 1,
            status,
            reason: reason.to_string(),
            headers: Headers::new(),
        }
    }

    /// 1xx other than 101 Switching Protocols.
    #[must_use]
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    /// Framing of the body that follows this head, given the request method.
    pub fn body_framing(&self, request_method: &str) -> Result<Framing, String> {
        if request_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Ok(Framing::Empty);
        }
        if request_method.eq_ignore_ascii_case("CONNECT") && (200..300).contains(&self.status) {
            return Ok(Framing::Empty);
        }
        match self.headers.declared_framing() {
            Ok(Some(framing)) => Ok(framing),
            Ok(None) => Ok(Framing::UntilClose),
            // Unknown transfer codings are delimited by connection close.
            Err(_) if self.headers.contains("Transfer-Encoding") => Ok(Framing::UntilClose),
            Err(e) => Err(e),
        }
    }

    /// Whether the sender announced it will close the connection.
    #[must_use]
    pub fn closes_connection(&self) -> bool {
        self.headers.has_token("Connection", "close")
            || self.headers.has_token("Proxy-Connection", "close")
            || (self.version == 0
                && !self.headers.has_token("Connection", "keep-alive")
                && !self.headers.has_token("Proxy-Connection", "keep-alive"))
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("HTTP/1.{} {} {}\r\n", self.version, self.status, self.reason).as_bytes(),
        );
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Why a head could not be read.
#[derive(Debug)]
pub enum HeadError {
    TooLarge,
    Truncated,
    Io(io::Error),
}

impl From<io::Error> for HeadError {
    fn from(e: io::Error) -> Self {
        HeadError::Io(e)
    }
}

/// Reads one head (start line through the empty line) without consuming
/// any body bytes. Returns `None` on EOF before the first byte. Empty
/// lines preceding the start line are skipped.
pub async fn read_head<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>, HeadError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(1024);
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(HeadError::Truncated)
            };
        }

        let (consumed, line_end) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        buf.extend_from_slice(&available[..consumed]);
        reader.consume(consumed);

        if buf.len() > limit {
            return Err(HeadError::TooLarge);
        }
        if !line_end {
            continue;
        }
        if buf == b"\r\n" || buf == b"\n" {
            buf.clear();
            continue;
        }
        if buf.ends_with(b"\n\r\n") || buf.ends_with(b"\n\n") {
            return Ok(Some(buf));
        }
    }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Done,
    Length(u64),
    Chunked(ChunkState),
    UntilClose,
}

/// Pull-based body decoder. Yields decoded payload bytes until the framing
/// says the body is over, then `None` forever.
#[derive(Debug, Clone)]
pub struct BodyReader {
    framing: Framing,
    state: BodyState,
}

impl BodyReader {
    #[must_use]
    pub fn new(framing: Framing) -> Self {
        let state = match framing {
            Framing::Empty | Framing::Length(0) => BodyState::Done,
            Framing::Length(n) => BodyState::Length(n),
            Framing::Chunked => BodyState::Chunked(ChunkState::Size),
            Framing::UntilClose => BodyState::UntilClose,
        };
        BodyReader { framing, state }
    }

    #[must_use]
    pub fn framing(&self) -> Framing {
        self.framing
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == BodyState::Done
    }

    /// Next decoded chunk, `None` at end of body.
    pub async fn next_chunk<R>(&mut self, reader: &mut R) -> io::Result<Option<Bytes>>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        loop {
            match self.state {
                BodyState::Done => return Ok(None),
                BodyState::UntilClose => {
                    let available = reader.fill_buf().await?;
                    if available.is_empty() {
                        self.state = BodyState::Done;
                        return Ok(None);
                    }
                    let n = available.len().min(READ_CHUNK);
                    let chunk = Bytes::copy_from_slice(&available[..n]);
                    reader.consume(n);
                    return Ok(Some(chunk));
                }
                BodyState::Length(remaining) => {
                    let chunk = read_exact_part(reader, remaining).await?;
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        BodyState::Done
                    } else {
                        BodyState::Length(left)
                    };
                    return Ok(Some(chunk));
                }
                BodyState::Chunked(ChunkState::Size) => {
                    let line = read_line(reader).await?;
                    let size = parse_chunk_size(&line)?;
                    self.state = BodyState::Chunked(if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    });
                }
                BodyState::Chunked(ChunkState::Data(remaining)) => {
                    let chunk = read_exact_part(reader, remaining).await?;
                    let left = remaining - chunk.len() as u64;
                    self.state = BodyState::Chunked(if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    });
                    return Ok(Some(chunk));
                }
                BodyState::Chunked(ChunkState::DataEnd) => {
                    let line = read_line(reader).await?;
                    if !trim_eol(&line).is_empty() {
                        return Err(invalid_data("missing CRLF after chunk data"));
                    }
                    self.state = BodyState::Chunked(ChunkState::Size);
                }
                BodyState::Chunked(ChunkState::Trailers) => {
                    let line = read_line(reader).await?;
                    if trim_eol(&line).is_empty() {
                        self.state = BodyState::Done;
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Reads and discards the rest of the body. Returns the byte count.
    pub async fn drain<R>(&mut self, reader: &mut R) -> io::Result<u64>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        let mut total = 0u64;
        while let Some(chunk) = self.next_chunk(reader).await? {
            total += chunk.len() as u64;
        }
        Ok(total)
    }
}

async fn read_exact_part<R>(reader: &mut R, remaining: u64) -> io::Result<Bytes>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let available = reader.fill_buf().await?;
    if available.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside a message body",
        ));
    }
    let n = available
        .len()
        .min(READ_CHUNK)
        .min(usize::try_from(remaining).unwrap_or(usize::MAX));
    let chunk = Bytes::copy_from_slice(&available[..n]);
    reader.consume(n);
    Ok(chunk)
}

async fn read_line<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside chunked framing",
            ));
        }
        let (consumed, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        line.extend_from_slice(&available[..consumed]);
        reader.consume(consumed);
        if line.len() > MAX_LINE {
            return Err(invalid_data("chunk line too long"));
        }
        if done {
            return Ok(line);
        }
    }
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(trim_eol(line)).map_err(|_| invalid_data("bad chunk size"))?;
    let size = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16).map_err(|_| invalid_data("bad chunk size"))
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Writes one chunk in chunked transfer coding. Empty input writes nothing.
pub async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if data.is_empty() {
        return Ok(());
    }
    writer
        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await?;
    writer.write_all(data).await?;
    writer.write_all(b"\r\n").await
}

/// Terminating chunk of a chunked body (no trailers).
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Complete plain-text response used for locally generated errors.
#[must_use]
pub fn simple_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    let mut head = ResponseHead::new(status, reason);
    head.headers
        .append("Content-Type", "text/plain; charset=utf-8");
    head.headers
        .append("Content-Length", body.len().to_string());
    head.headers.append("Connection", "close");
    let mut out = head.to_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn collect(framing: Framing, wire: &[u8]) -> io::Result<Vec<u8>> {
        let mut reader = BufReader::new(wire);
        let mut body = BodyReader::new(framing);
        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk(&mut reader).await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    #[test]
    fn test_parse_absolute_request() {
        let head = RequestHead::parse(
            b"GET http://example.com/data HTTP/1.1\r\nHost: example.com\r\nX-Trace: 1\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://example.com/data");
        assert_eq!(head.version, 1);
        assert_eq!(head.headers.get("host"), Some("example.com"));
        assert_eq!(head.body_framing().unwrap(), Framing::Empty);
    }

    #[test]
    fn test_header_value_outlives_name_argument() {
        let head = RequestHead::parse(b"GET http://h/ HTTP/1.1\r\nX-Trace: 7\r\nX-Trace: 8\r\n\r\n").unwrap();
        let value = {
            let name = String::from("x-trace");
            head.headers.get(&name)
        };
        assert_eq!(value, Some("7"));
        assert_eq!(head.headers.get("X-Missing"), None);
    }

    #[test]
    fn test_request_roundtrip_preserves_order_and_case() {
        let wire = b"POST http://h/p HTTP/1.1\r\nhost: h\r\nX-B: 2\r\nX-A: 1\r\nContent-Length: 3\r\n\r\n";
        let head = RequestHead::parse(wire).unwrap();
        assert_eq!(head.to_bytes(), wire.to_vec());
        assert_eq!(head.body_framing().unwrap(), Framing::Length(3));
    }

    #[test]
    fn test_conflicting_content_length_rejected() {
        let head = RequestHead::parse(
            b"POST http://h/ HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n",
        )
        .unwrap();
        assert!(head.body_framing().is_err());
    }

    #[test]
    fn test_transfer_encoding_wins_over_length() {
        let head = RequestHead::parse(
            b"POST http://h/ HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: gzip, chunked\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.body_framing().unwrap(), Framing::Chunked);
    }

    #[test]
    fn test_response_framing_rules() {
        let ok = ResponseHead::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n").unwrap();
        assert_eq!(ok.body_framing("GET").unwrap(), Framing::Length(2));
        assert_eq!(ok.body_framing("HEAD").unwrap(), Framing::Empty);
        assert_eq!(ok.body_framing("CONNECT").unwrap(), Framing::Empty);

        let open = ResponseHead::parse(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        assert_eq!(open.body_framing("GET").unwrap(), Framing::UntilClose);

        let none = ResponseHead::parse(b"HTTP/1.1 304 Not Modified\r\nContent-Length: 10\r\n\r\n")
            .unwrap();
        assert_eq!(none.body_framing("GET").unwrap(), Framing::Empty);
    }

    #[test]
    fn test_closes_connection() {
        let close = ResponseHead::parse(b"HTTP/1.1 407 X\r\nProxy-Connection: close\r\n\r\n").unwrap();
        assert!(close.closes_connection());
        let keep = ResponseHead::parse(b"HTTP/1.1 407 X\r\nConnection: keep-alive\r\n\r\n").unwrap();
        assert!(!keep.closes_connection());
        let old = ResponseHead::parse(b"HTTP/1.0 407 X\r\n\r\n").unwrap();
        assert!(old.closes_connection());
    }

    #[test]
    fn test_headers_strip_and_tokens() {
        let mut headers = Headers::new();
        headers.append("Connection", "keep-alive, Upgrade");
        headers.append("Proxy-Authorization", "Basic abc");
        headers.append("proxy-connection", "keep-alive");
        headers.append("Accept", "*/*");
        assert!(headers.has_token("connection", "upgrade"));

        headers.strip(REQUEST_HOP_HEADERS);
        assert_eq!(headers.len(), 2);
        assert!(!headers.contains("Proxy-Connection"));

        headers.set("Accept", "text/plain");
        assert_eq!(headers.get_all("accept").collect::<Vec<_>>(), vec!["text/plain"]);
    }

    #[tokio::test]
    async fn test_read_head_leaves_body_unread() {
        let wire: &[u8] = b"\r\nPOST http://h/ HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody";
        let mut reader = BufReader::new(wire);
        let head = read_head(&mut reader, MAX_HEADER_SIZE).await.unwrap().unwrap();
        assert!(head.starts_with(b"POST"));
        assert_eq!(reader.buffer(), b"body");
    }

    #[tokio::test]
    async fn test_read_head_eof_and_limits() {
        let mut empty = BufReader::new(&b""[..]);
        assert!(read_head(&mut empty, MAX_HEADER_SIZE).await.unwrap().is_none());

        let mut truncated = BufReader::new(&b"GET http://h/ HTTP/1.1\r\nHost"[..]);
        assert!(matches!(
            read_head(&mut truncated, MAX_HEADER_SIZE).await,
            Err(HeadError::Truncated)
        ));

        let big = format!("GET / HTTP/1.1\r\nX: {}\r\n\r\n", "a".repeat(200));
        let mut reader = BufReader::new(big.as_bytes());
        assert!(matches!(
            read_head(&mut reader, 64).await,
            Err(HeadError::TooLarge)
        ));
    }

    #[tokio::test]
    async fn test_chunked_body_with_trailers() {
        let wire = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nExpires: never\r\n\r\nNEXT";
        let mut reader = BufReader::new(&wire[..]);
        let mut body = BodyReader::new(Framing::Chunked);
        let mut out = Vec::new();
        while let Some(chunk) = body.next_chunk(&mut reader).await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"Wikipedia");
        assert!(body.is_done());
        assert_eq!(reader.buffer(), b"NEXT");
    }

    #[tokio::test]
    async fn test_length_body_truncated_is_error() {
        let err = collect(Framing::Length(10), b"short").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_until_close_body() {
        assert_eq!(collect(Framing::UntilClose, b"all of it").await.unwrap(), b"all of it");
    }

    #[tokio::test]
    async fn test_bad_chunk_size() {
        let err = collect(Framing::Chunked, b"zz\r\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_write_chunk_encoding() {
        let mut out: Vec<u8> = Vec::new();
        write_chunk(&mut out, b"hello world").await.unwrap();
        write_chunk(&mut out, b"").await.unwrap();
        out.extend_from_slice(LAST_CHUNK);
        assert_eq!(out, b"b\r\nhello world\r\n0\r\n\r\n");
    }

    #[test]
    fn test_simple_response() {
        let bytes = simple_response(502, "Bad Gateway", "nope");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\nnope"));
    }
}
