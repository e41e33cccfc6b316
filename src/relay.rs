// Plain-HTTP relay, one request/response pair per downstream connection

use crate::error::{ProxyError, Result};
use crate::http::{self, BodyReader, Framing, RequestHead, ResponseHead, RESPONSE_HOP_HEADERS};
use crate::session::ProxySession;
use crate::upstream::{Connector, RequestBody, UpstreamChannel, UpstreamRequest, UpstreamResponse};
use bytes::Bytes;
use std::io;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

/// Value appended to the `Via` header of every relayed response.
pub const VIA: &str = "1.1 ntlm-bridge";

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Forwards `head` (already stripped of downstream hop headers) and its
/// body upstream, then streams the response back. Returns the status
/// written downstream.
///
/// Errors returned before the response head is written still map to a
/// status line; afterwards they surface as [`ProxyError::Stream`].
pub async fn relay_http<C, D>(
    connector: &C,
    session: &ProxySession,
    mut head: RequestHead,
    downstream: &mut D,
) -> Result<u16>
where
    C: Connector + ?Sized,
    D: AsyncBufRead + AsyncWrite + Unpin + Send,
{
    let framing = head.body_framing().map_err(ProxyError::ClientProtocol)?;
    let expects_continue = head.headers.has_token("Expect", "100-continue");
    head.headers.remove("Expect");

    if expects_continue && framing != Framing::Empty {
        downstream.write_all(CONTINUE).await?;
        downstream.flush().await?;
    }

    let body = match framing {
        Framing::Empty => None,
        framing => Some(RequestBody {
            reader: BodyReader::new(framing),
            source: &mut *downstream,
        }),
    };

    let channel = connector
        .connect(UpstreamRequest::Http {
            head,
            body,
            deadline: session.deadline,
        })
        .await?;
    let UpstreamChannel::Http(mut response) = channel else {
        return Err(ProxyError::UpstreamProtocol(
            "connector returned a tunnel for an HTTP request".to_string(),
        ));
    };

    // Nothing goes downstream until the body's first chunk (or its end) is known.
    let first = read_chunk(&mut response, session.deadline)
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => ProxyError::Timeout,
            _ => ProxyError::Io(e),
        })?;

    let status = response.head.status;
    let out = downstream_head(&response.head, response.framing());
    downstream.write_all(&out.to_bytes()).await.map_err(ProxyError::Stream)?;

    let sent = stream_body(&mut response, first, downstream, session.deadline)
        .await
        .map_err(ProxyError::Stream)?;
    tracing::debug!(status, bytes = sent, "Response relayed to {}", session.peer);

    downstream.flush().await.map_err(ProxyError::Stream)?;
    let _ = downstream.shutdown().await;
    Ok(status)
}

/// Response head as sent to the client: upstream hop headers removed, the
/// connection closed after the body, close-delimited when the length is
/// not known up front.
pub fn downstream_head(upstream: &ResponseHead, framing: Framing) -> ResponseHead {
    let mut head = ResponseHead::new(upstream.status, &upstream.reason);
    head.headers = upstream.headers.clone();
    head.headers.strip(RESPONSE_HOP_HEADERS);
    if matches!(framing, Framing::Chunked | Framing::UntilClose) {
        head.headers.remove("Content-Length");
    }
    head.headers.append("Via", VIA);
    head.headers.append("Connection", "close");
    head
}

async fn read_chunk(response: &mut UpstreamResponse, deadline: Instant) -> io::Result<Option<Bytes>> {
    match timeout_at(deadline, response.next_chunk()).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "total timeout exceeded")),
    }
}

async fn stream_body<W>(
    response: &mut UpstreamResponse,
    first: Option<Bytes>,
    downstream: &mut W,
    deadline: Instant,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0u64;
    let mut next = first;
    while let Some(chunk) = next {
        downstream.write_all(&chunk).await?;
        total += chunk.len() as u64;
        next = read_chunk(response, deadline).await?;
    }
    Ok(total)
}

/// Writes a locally generated error response for `err`, if one still fits.
pub async fn write_error<W>(downstream: &mut W, err: &ProxyError) -> io::Result<Option<u16>>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let Some((status, reason)) = err.response_status() else {
        return Ok(None);
    };
    let body = format!("{}\n", err.client_message());
    downstream
        .write_all(&http::simple_response(status, reason, &body))
        .await?;
    downstream.flush().await?;
    let _ = downstream.shutdown().await;
    Ok(Some(status))
}
