// CONNECT tunnel relay
use crate::error::{ProxyError, Result};
use crate::session::ProxySession;
use crate::upstream::{Connector, UpstreamChannel, UpstreamRequest};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

pub const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const COPY_BUF: usize = 16 * 1024;

/// Opens the upstream tunnel for `session.target`, confirms it to the
/// client and splices bytes until either side finishes.
///
/// `downstream` may still buffer bytes the client sent right after the
/// CONNECT head; they are forwarded first.
pub async fn relay_tunnel<C, D>(
    connector: &C,
    session: &ProxySession,
    downstream: &mut D,
    idle: Duration,
) -> Result<u16>
where
    C: Connector + ?Sized,
    D: AsyncRead + AsyncWrite + Unpin + Send,
{
    let channel = connector
        .connect(UpstreamRequest::Tunnel {
            authority: session.target.clone(),
        })
        .await?;
    let UpstreamChannel::Tunnel(stream) = channel else {
        return Err(ProxyError::UpstreamProtocol(
            "connector returned an HTTP response for CONNECT".to_string(),
        ));
    };

    let (mut client_read, mut client_write) = tokio::io::split(downstream);
    client_write.write_all(ESTABLISHED).await?;
    client_write.flush().await?;
    tracing::info!("Tunnel established to {}", session.target);

    let (mut server_read, mut server_write) = tokio::io::split(stream.into_inner());

    tokio::select! {
        res = pipe(&mut client_read, &mut server_write, idle) => {
            match res {
                Ok(n) => tracing::debug!("Client->Upstream: {} bytes", n),
                Err(e) => tracing::debug!("Client->Upstream ended: {}", e),
            }
        }
        res = pipe(&mut server_read, &mut client_write, idle) => {
            match res {
                Ok(n) => tracing::debug!("Upstream->Client: {} bytes", n),
                Err(e) => tracing::debug!("Upstream->Client ended: {}", e),
            }
        }
    };

    let _ = client_write.shutdown().await;
    let _ = server_write.shutdown().await;

    tracing::debug!("Tunnel to {} closed", session.target);
    Ok(200)
}

/// Copies until EOF. Each read and each write must make progress within `idle`.
async fn pipe<R, W>(reader: &mut R, writer: &mut W, idle: Duration) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = timeout(idle, reader.read(&mut buf))
            .await
            .map_err(|_| idle_error())??;
        if n == 0 {
            return Ok(total);
        }
        timeout(idle, writer.write_all(&buf[..n]))
            .await
            .map_err(|_| idle_error())??;
        timeout(idle, writer.flush())
            .await
            .map_err(|_| idle_error())??;
        total += n as u64;
    }
}

fn idle_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "idle timeout")
}
