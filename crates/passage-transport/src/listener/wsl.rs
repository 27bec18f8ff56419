//! WebSocket listener.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tracing::debug;

use passage_core::contract::{ConnMeta, Listener, Stream};
use passage_core::defaults::DEFAULT_ACCEPT_QUEUE_SIZE;
use passage_core::error::Result;
use passage_core::metadata::Metadata;

use crate::queue::{AcceptQueue, accept_queue};
use crate::stream::WsIo;
use crate::tls::server_config;

/// TCP (+TLS when cert material is configured) + HTTP/1.1 Upgrade at a
/// configured path. Upgrades run per-connection; each established
/// socket lands in the bounded accept queue.
///
/// Metadata: `path` (default `/`), `queueSize`, and the TLS server keys
/// for `wss`.
pub struct WsListener {
    queue: AcceptQueue,
    local: SocketAddr,
}

impl WsListener {
    pub async fn bind(addr: &str, md: &Metadata) -> Result<Self> {
        let acceptor = if md.contains("certFile") {
            Some(TlsAcceptor::from(server_config(md)?))
        } else {
            None
        };
        let path = match md.get_str("path") {
            "" => "/".to_string(),
            p => p.to_string(),
        };
        let queue_size = match md.get_int("queueSize") {
            0 => DEFAULT_ACCEPT_QUEUE_SIZE,
            n => n as usize,
        };

        let tcp = tokio::net::TcpListener::bind(addr).await?;
        let local = tcp.local_addr()?;
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
                let path = path.clone();
                tokio::spawn(async move {
                    let stream: Stream = match &acceptor {
                        Some(tls) => match tls.accept(stream).await {
                            Ok(s) => Box::new(s),
                            Err(e) => {
                                debug!(peer = %peer, error = %e, "tls accept failed");
                                return;
                            }
                        },
                        None => Box::new(stream),
                    };

                    let check_path = |req: &Request, resp: Response| {
                        if req.uri().path() == path {
                            Ok(resp)
                        } else {
                            let mut not_found = ErrorResponse::new(None);
                            *not_found.status_mut() =
                                tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
                            Err(not_found)
                        }
                    };
                    match accept_hdr_async(stream, check_path).await {
                        Ok(ws) => sender.push(Box::new(WsIo::new(ws)), ConnMeta::new(peer).with_local(local)),
                        Err(e) => debug!(peer = %peer, error = %e, "ws upgrade failed"),
                    }
                });
            }
        });

        Ok(Self { queue, local })
    }
}

#[async_trait]
impl Listener for WsListener {
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

#[cfg(test)]
mod tests {
    use super::*;
    use passage_core::addr::Address;
    use passage_core::contract::{Dialer, DialerOptions};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dialer_and_listener_speak_binary_frames() {
        let ln = WsListener::bind("127.0.0.1:0", &Metadata::new())
            .await
            .unwrap();
        let addr: Address = ln.local_addr().unwrap().into();

        let dialer = crate::dialer::WsDialer::new(&DialerOptions::default()).unwrap();
        let client = tokio::spawn(async move {
            let raw = dialer.dial(&addr).await.unwrap();
            let mut ws = dialer.handshake(raw, &addr).await.unwrap();
            ws.write_all(b"over websocket").await.unwrap();
            let mut buf = [0u8; 4];
            ws.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"back");
        });

        let (mut stream, _peer) = ln.accept().await.unwrap();
        let mut buf = [0u8; 14];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over websocket");
        stream.write_all(b"back").await.unwrap();
        stream.flush().await.unwrap();

        client.await.unwrap();
        ln.close();
    }

    #[tokio::test]
    async fn wrong_path_is_rejected() {
        let mut md = Metadata::new();
        md.set("path", "/tunnel");
        let ln = WsListener::bind("127.0.0.1:0", &md).await.unwrap();
        let addr: Address = ln.local_addr().unwrap().into();

        let dialer = crate::dialer::WsDialer::new(&DialerOptions::default()).unwrap();
        let raw = dialer.dial(&addr).await.unwrap();
        // dialer defaults to "/", listener wants "/tunnel"
        assert!(dialer.handshake(raw, &addr).await.is_err());
        ln.close();
    }
}
