//! TCP relay
//!
//! Full-duplex copy between the client and the upstream. Each direction
//! refreshes a per-read idle deadline; the first direction to stop (EOF,
//! error or timeout) ends the session and both endpoints are closed when
//! the relay returns.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use crate::metrics::METRICS;
use crate::pool::{Buffer, BufferPool};

/// Why a relay direction stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closed {
    Eof,
    Error,
    IdleTimeout,
}

/// Shuttle bytes between the two endpoints until either half terminates.
pub async fn run<C, U>(client: C, upstream: U, pool: &BufferPool, idle_timeout: Duration)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = copy_half(
        &mut client_read,
        &mut upstream_write,
        pool.acquire(),
        idle_timeout,
        true,
    );
    let upstream_to_client = copy_half(
        &mut upstream_read,
        &mut client_write,
        pool.acquire(),
        idle_timeout,
        false,
    );

    // Whichever direction finishes first wins the race; dropping the
    // halves afterwards closes both sockets, which terminates the
    // partner direction as well.
    tokio::select! {
        (bytes, closed) = client_to_upstream => {
            debug!(bytes, reason = ?closed, "client-to-upstream finished");
        }
        (bytes, closed) = upstream_to_client => {
            debug!(bytes, reason = ?closed, "upstream-to-client finished");
        }
    }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    mut buf: Buffer,
    idle_timeout: Duration,
    from_client: bool,
) -> (u64, Closed)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total: u64 = 0;

    loop {
        let n = match timeout(idle_timeout, reader.read(&mut buf)).await {
            Err(_) => {
                METRICS.timeout();
                return (total, Closed::IdleTimeout);
            }
            Ok(Err(_)) => return (total, Closed::Error),
            Ok(Ok(0)) => return (total, Closed::Eof),
            Ok(Ok(n)) => n,
        };

        if writer.write_all(&buf[..n]).await.is_err() {
            return (total, Closed::Error);
        }

        total += n as u64;
        if from_client {
            METRICS.bytes_rx(n as u64);
        } else {
            METRICS.bytes_tx(n as u64);
        }
    }
}
