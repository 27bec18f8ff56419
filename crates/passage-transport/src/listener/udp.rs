//! UDP listener with per-peer sessions.
//!
//! One socket serves many peers. Datagrams are demultiplexed by source
//! address into sessions; each new peer surfaces as one `accept` result
//! whose stream moves one datagram per read/write. Idle sessions are
//! evicted after a TTL.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

use passage_core::contract::{ConnMeta, Listener, Stream};
use passage_core::defaults::{DEFAULT_ACCEPT_QUEUE_SIZE, DEFAULT_UDP_SESSION_TTL};
use passage_core::error::Result;
use passage_core::metadata::Metadata;

use crate::queue::{AcceptQueue, accept_queue};

const SESSION_CHANNEL_DEPTH: usize = 64;

/// Demultiplexing UDP listener.
///
/// Metadata: `queueSize` (accept queue bound), `ttl` (idle session
/// eviction).
pub struct UdpSessionListener {
    queue: AcceptQueue,
    local: SocketAddr,
}

impl UdpSessionListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with(addr, &Metadata::new()).await
    }

    pub async fn bind_with(addr: &str, md: &Metadata) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;

        let queue_size = match md.get_int("queueSize") {
            0 => DEFAULT_ACCEPT_QUEUE_SIZE,
            n => n as usize,
        };
        let ttl = match md.get_duration("ttl") {
            d if d.is_zero() => DEFAULT_UDP_SESSION_TTL,
            d => d,
        };

        let (queue, sender) = accept_queue(queue_size);
        let token = sender.token();
        tokio::spawn(async move {
            let mut sessions: HashMap<SocketAddr, SessionEntry> = HashMap::new();
            let mut sweep = tokio::time::interval(ttl);
            let mut buf = vec![0u8; 65536];
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sweep.tick() => {
                        sessions.retain(|peer, entry| {
                            let keep = entry.last_seen.elapsed() < ttl && !entry.tx.is_closed();
                            if !keep {
                                debug!(peer = %peer, "udp session evicted");
                            }
                            keep
                        });
                    }
                    received = socket.recv_from(&mut buf) => {
                        let Ok((n, peer)) = received else { return };
                        let entry = sessions.entry(peer).or_insert_with(|| {
                            let (tx, rx) = mpsc::channel(SESSION_CHANNEL_DEPTH);
                            let session = UdpSession {
                                rx,
                                socket: socket.clone(),
                                peer,
                            };
                            sender.push(Box::new(session), ConnMeta::new(peer).with_local(local));
                            SessionEntry { tx, last_seen: Instant::now() }
                        });
                        entry.last_seen = Instant::now();
                        // drop the datagram when the session lags
                        let _ = entry.tx.try_send(buf[..n].to_vec());
                    }
                }
            }
        });

        Ok(Self { queue, local })
    }
}

struct SessionEntry {
    tx: mpsc::Sender<Vec<u8>>,
    last_seen: Instant,
}

#[async_trait]
impl Listener for UdpSessionListener {
    async fn accept(&self) -> Result<(Stream, ConnMeta)> {
        self.queue.recv().await
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }

    fn close(&self) {
        self.queue.close();
    }
}

/// One peer's view of the shared socket.
struct UdpSession {
    rx: mpsc::Receiver<Vec<u8>>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl AsyncRead for UdpSession {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(datagram)) => {
                let n = datagram.len().min(buf.remaining());
                buf.put_slice(&datagram[..n]);
                Poll::Ready(Ok(()))
            }
            // listener gone: EOF
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for UdpSession {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let peer = self.peer;
        self.socket.poll_send_to(cx, buf, peer)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn peers_get_separate_sessions() {
        let ln = UdpSessionListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.send_to(b"from-a", addr).await.unwrap();
        b.send_to(b"from-b", addr).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let (mut stream, meta) = ln.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).await.unwrap();
            seen.push((meta.peer, buf[..n].to_vec()));
        }
        seen.sort_by_key(|(_, payload)| payload.clone());
        assert_eq!(seen[0].1, b"from-a");
        assert_eq!(seen[1].1, b"from-b");
        ln.close();
    }

    #[tokio::test]
    async fn session_writes_reach_the_peer() {
        let ln = UdpSessionListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", addr).await.unwrap();

        let (mut stream, _) = ln.accept().await.unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        stream.write_all(b"reply").await.unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply");
        ln.close();
    }
}
