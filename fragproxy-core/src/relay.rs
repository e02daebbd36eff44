//! Bidirectional byte relay with half-close propagation.

use prometheus::IntCounter;
use std::io;
use tokio::io::{self as tio, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Relays bytes in both directions until each side has finished.
///
/// The two directional loops run concurrently and independently: a read
/// returning 0 or a write error ends only that loop, which then shuts down
/// its destination's write half so the peer sees an orderly EOF while the
/// opposite loop keeps draining. The call returns once BOTH loops have
/// ended; per-direction errors are demoted to debug logs since a peer reset
/// mid-tunnel is ordinary.
///
/// Backpressure is the loops' own blocking: a slow destination stalls its
/// source's reads, nothing is buffered beyond `buffer_size` bytes.
pub async fn run<C, U>(
    client: C,
    upstream: U,
    buffer_size: usize,
    counters: Option<(IntCounter, IntCounter)>,
) where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tio::split(client);
    let (mut upstream_read, mut upstream_write) = tio::split(upstream);
    let (tx_counter, rx_counter) = match counters {
        Some((tx, rx)) => (Some(tx), Some(rx)),
        None => (None, None),
    };

    let client_to_upstream = async {
        let result =
            copy_direction(&mut client_read, &mut upstream_write, buffer_size, tx_counter).await;
        let _ = upstream_write.shutdown().await;
        if let Err(e) = result {
            debug!(direction = "client->upstream", error = %e, "Relay direction ended on error");
        }
    };

    let upstream_to_client = async {
        let result =
            copy_direction(&mut upstream_read, &mut client_write, buffer_size, rx_counter).await;
        let _ = client_write.shutdown().await;
        if let Err(e) = result {
            debug!(direction = "upstream->client", error = %e, "Relay direction ended on error");
        }
    };

    // join, not try_join: one direction failing must never cancel the other
    tokio::join!(client_to_upstream, upstream_to_client);
}

async fn copy_direction<R, W>(
    src: &mut R,
    dst: &mut W,
    buffer_size: usize,
    counter: Option<IntCounter>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).await?;
        if let Some(ref counter) = counter {
            counter.inc_by(n as u64);
        }
    }
    Ok(())
}
