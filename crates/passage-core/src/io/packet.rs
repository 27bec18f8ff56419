//! Packet-connection shape and adapters.
//!
//! UDP paths deal in datagrams. A [`PacketConn`] exposes the
//! receive-with-source / send-to-remote shape; [`StreamPacketConn`]
//! adapts a chained byte stream to that shape by degrading to plain
//! reads and writes against a fixed remote. Per-datagram addressing
//! beyond that remote is intentionally dropped: a chained UDP
//! association is point-to-point by construction.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::pool;
use super::relay::RelayStats;
use crate::contract::Stream;
use crate::error::Result;

/// A connection moving whole datagrams.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Receive one datagram and its source address.
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Send one datagram toward the connection's remote.
    async fn send(&self, buf: &[u8]) -> Result<usize>;

    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// Packet view over a chained byte stream: each read is one datagram,
/// each send is one write, and every datagram is attributed to the
/// fixed remote.
pub struct StreamPacketConn {
    inner: Mutex<Stream>,
    remote: SocketAddr,
}

impl StreamPacketConn {
    pub fn new(inner: Stream, remote: SocketAddr) -> Self {
        Self {
            inner: Mutex::new(inner),
            remote,
        }
    }
}

#[async_trait]
impl PacketConn for StreamPacketConn {
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let n = self.inner.lock().await.read(buf).await?;
        Ok((n, self.remote))
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        inner.write_all(buf).await?;
        inner.flush().await?;
        Ok(buf.len())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }
}

/// Copy datagrams between `a` and `b` until either side reports EOF
/// (zero-length receive from a stream-backed side), an error occurs, or
/// the idle timeout fires.
pub async fn relay_packets(
    a: Arc<dyn PacketConn>,
    b: Arc<dyn PacketConn>,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
) -> Result<RelayStats> {
    let a2b = pump(a.clone(), b.clone(), buffer_size, idle_timeout);
    let b2a = pump(b, a, buffer_size, idle_timeout);

    let (a_to_b, b_to_a) = tokio::join!(a2b, b2a);
    Ok(RelayStats {
        a_to_b: a_to_b?,
        b_to_a: b_to_a?,
    })
}

async fn pump(
    from: Arc<dyn PacketConn>,
    to: Arc<dyn PacketConn>,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
) -> Result<u64> {
    let mut buf = pool::get(buffer_size);
    let mut moved = 0u64;
    loop {
        let received = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, from.recv(&mut buf)).await {
                Ok(r) => r,
                Err(_) => return Ok(moved),
            },
            None => from.recv(&mut buf).await,
        };
        let (n, _) = match received {
            Ok(r) => r,
            Err(e) if moved > 0 => {
                tracing::debug!(error = %e, "packet relay direction ended");
                return Ok(moved);
            }
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Ok(moved);
        }
        to.send(&buf[..n]).await?;
        moved += n as u64;
    }
}
