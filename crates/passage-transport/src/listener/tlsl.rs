//! TLS listener.
//!
//! Handshakes run in per-connection tasks feeding the bounded accept
//! queue, so one slow client cannot stall the accept loop.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use passage_core::contract::{ConnMeta, Listener, Stream};
use passage_core::defaults::DEFAULT_ACCEPT_QUEUE_SIZE;
use passage_core::error::Result;
use passage_core::metadata::Metadata;

use crate::queue::{AcceptQueue, accept_queue};
use crate::tls::server_config;

const TLS_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP + server-side TLS handshake.
///
/// Metadata: `certFile`, `keyFile`, `alpn`, `queueSize`.
pub struct TlsListener {
    queue: AcceptQueue,
    local: SocketAddr,
}

impl TlsListener {
    pub async fn bind(addr: &str, md: &Metadata) -> Result<Self> {
        let acceptor = TlsAcceptor::from(server_config(md)?);
        let tcp = tokio::net::TcpListener::bind(addr).await?;
        let local = tcp.local_addr()?;

        let queue_size = match md.get_int("queueSize") {
            0 => DEFAULT_ACCEPT_QUEUE_SIZE,
            n => n as usize,
        };
        let (queue, sender) = accept_queue(queue_size);
        let token = sender.token();

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => return,
                    accepted = tcp.accept() => accepted,
                };
                let Ok((stream, peer)) = accepted else { return };
                let _ = stream.set_nodelay(true);

                let acceptor = acceptor.clone();
                let sender = sender.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(TLS_ACCEPT_TIMEOUT, acceptor.accept(stream)).await
                    {
                        Ok(Ok(tls)) => sender.push(Box::new(tls), ConnMeta::new(peer).with_local(local)),
                        Ok(Err(e)) => debug!(peer = %peer, error = %e, "tls accept failed"),
                        Err(_) => debug!(peer = %peer, "tls accept timed out"),
                    }
                });
            }
        });

        Ok(Self { queue, local })
    }
}

#[async_trait]
impl Listener for TlsListener {
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
