//! HTTP/2 listener.
//!
//! Each TCP connection becomes an HTTP/2 session; every CONNECT stream
//! on it is delivered as a separate accept result.

use std::net::SocketAddr;

use async_trait::async_trait;
use http::{Method, Response, StatusCode};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use passage_core::contract::{ConnMeta, Listener, Stream};
use passage_core::defaults::DEFAULT_ACCEPT_QUEUE_SIZE;
use passage_core::error::Result;
use passage_core::metadata::Metadata;

use crate::queue::{AcceptQueue, AcceptSender, accept_queue};
use crate::stream::H2Io;
use crate::tls::server_config;

/// Demultiplexing HTTP/2 listener.
///
/// Metadata: `queueSize`, `plaintext` (h2c), and the TLS server keys
/// otherwise (ALPN forced to `h2`).
pub struct H2Listener {
    queue: AcceptQueue,
    local: SocketAddr,
}

impl H2Listener {
    pub async fn bind(addr: &str, md: &Metadata) -> Result<Self> {
        let acceptor = if md.get_bool("plaintext") {
            None
        } else {
            let mut md = md.clone();
            if md.get_str_list("alpn").is_empty() {
                md.set("alpn", serde_json::json!(["h2"]));
            }
            Some(TlsAcceptor::from(server_config(&md)?))
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
                    serve_session(stream, ConnMeta::new(peer).with_local(local), sender).await;
                });
            }
        });

        Ok(Self { queue, local })
    }
}

/// Run one HTTP/2 session, queueing each CONNECT stream.
async fn serve_session(stream: Stream, meta: ConnMeta, sender: AcceptSender) {
    let peer = meta.peer;
    let mut session = match h2::server::handshake(stream).await {
        Ok(s) => s,
        Err(e) => {
            debug!(peer = %peer, error = %e, "h2 handshake failed");
            return;
        }
    };

    while let Some(request) = session.accept().await {
        let Ok((request, mut respond)) = request else {
            return;
        };
        if request.method() != Method::CONNECT {
            let response = Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(())
                .expect("static response");
            let _ = respond.send_response(response, true);
            continue;
        }

        let response = Response::builder()
            .status(StatusCode::OK)
            .body(())
            .expect("static response");
        match respond.send_response(response, false) {
            Ok(send) => {
                let io: H2Io = H2Io::new(send, request.into_body());
                sender.push(Box::new(io), meta);
            }
            Err(e) => debug!(peer = %peer, error = %e, "h2 response failed"),
        }
    }
}

#[async_trait]
impl Listener for H2Listener {
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

    fn plaintext_md() -> Metadata {
        let mut md = Metadata::new();
        md.set("plaintext", true);
        md
    }

    #[tokio::test]
    async fn connect_streams_are_demultiplexed() {
        let ln = H2Listener::bind("127.0.0.1:0", &plaintext_md())
            .await
            .unwrap();
        let addr: Address = ln.local_addr().unwrap().into();

        let mut opts = DialerOptions::default();
        opts.metadata.set("plaintext", true);
        let dialer = std::sync::Arc::new(crate::dialer::H2Dialer::new(&opts).unwrap());
        assert!(dialer.multiplex());

        // two logical streams over one session
        for payload in [&b"first"[..], &b"second"[..]] {
            let dialer = dialer.clone();
            let addr = addr.clone();
            let payload_vec = payload.to_vec();
            let client = tokio::spawn(async move {
                let mut s = dialer.dial(&addr).await.unwrap();
                s.write_all(&payload_vec).await.unwrap();
                s.flush().await.unwrap();
                let mut buf = vec![0u8; 2];
                s.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, b"ok");
            });

            let (mut stream, _peer) = ln.accept().await.unwrap();
            let mut buf = vec![0u8; payload.len()];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, payload);
            stream.write_all(b"ok").await.unwrap();
            stream.flush().await.unwrap();
            client.await.unwrap();
        }
        ln.close();
    }
}
