//! Reverse listeners: bind through the chain instead of locally.
//!
//! On first accept the router traverses the chain and asks the last
//! hop to open a remote listener; accepted remote connections are
//! delivered back through the chain. When the remote listener ends
//! (the SOCKS5 BIND backend is single-accept), the next accept
//! re-binds.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use passage_chain::Router;
use passage_core::addr::{Address, Network};
use passage_core::contract::{ConnMeta, Listener, Stream};
use passage_core::defaults::ACCEPT_RETRY_BACKOFF;
use passage_core::error::{Error, Result};

struct ReverseListener {
    network: Network,
    addr: Address,
    router: Arc<Router>,
    remote: Mutex<Option<Box<dyn Listener>>>,
    token: CancellationToken,
}

impl ReverseListener {
    fn new(network: Network, addr: Address, router: Arc<Router>) -> Self {
        Self {
            network,
            addr,
            router,
            remote: Mutex::new(None),
            token: CancellationToken::new(),
        }
    }

    async fn accept(&self) -> Result<(Stream, ConnMeta)> {
        loop {
            if self.token.is_cancelled() {
                return Err(Error::Closed);
            }

            let mut slot = self.remote.lock().await;
            if slot.is_none() {
                let bound = tokio::select! {
                    _ = self.token.cancelled() => return Err(Error::Closed),
                    bound = self.router.bind(self.network, &self.addr) => bound,
                };
                match bound {
                    Ok(ln) => {
                        debug!(addr = %self.addr, network = %self.network, "remote listener bound");
                        *slot = Some(ln);
                    }
                    Err(e) => {
                        warn!(addr = %self.addr, error = %e, "remote bind failed");
                        drop(slot);
                        tokio::select! {
                            _ = self.token.cancelled() => return Err(Error::Closed),
                            _ = tokio::time::sleep(ACCEPT_RETRY_BACKOFF) => continue,
                        }
                    }
                }
            }
            let remote = slot.as_ref().expect("bound above");

            let accepted = tokio::select! {
                _ = self.token.cancelled() => return Err(Error::Closed),
                accepted = remote.accept() => accepted,
            };
            match accepted {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    // remote listener spent or broken: rebind on the
                    // next turn
                    debug!(addr = %self.addr, error = %e, "remote listener ended");
                    if let Some(old) = slot.take() {
                        old.close();
                    }
                }
            }
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.addr
            .to_socket_addr()
            .ok_or_else(|| Error::Protocol(format!("unresolved bind address {}", self.addr)))
    }

    fn close(&self) {
        self.token.cancel();
        if let Ok(mut slot) = self.remote.try_lock() {
            if let Some(ln) = slot.take() {
                ln.close();
            }
        }
    }
}

/// Reverse TCP listener (`rtcp`).
pub struct ReverseTcpListener(ReverseListener);

impl ReverseTcpListener {
    pub fn new(addr: Address, router: Arc<Router>) -> Self {
        Self(ReverseListener::new(Network::Tcp, addr, router))
    }
}

#[async_trait]
impl Listener for ReverseTcpListener {
    async fn accept(&self) -> Result<(Stream, ConnMeta)> {
        self.0.accept().await
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.0.local_addr()
    }

    fn close(&self) {
        self.0.close();
    }
}

/// Reverse UDP listener (`rudp`).
pub struct ReverseUdpListener(ReverseListener);

impl ReverseUdpListener {
    pub fn new(addr: Address, router: Arc<Router>) -> Self {
        Self(ReverseListener::new(Network::Udp, addr, router))
    }
}

#[async_trait]
impl Listener for ReverseUdpListener {
    async fn accept(&self) -> Result<(Stream, ConnMeta)> {
        self.0.accept().await
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.0.local_addr()
    }

    fn close(&self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // With an empty chain the router binds locally, which exercises the
    // full bind-on-first-accept cycle without a remote hop.
    #[tokio::test]
    async fn binds_through_the_router_on_first_accept() {
        // pick a free port up front so the client knows where to go
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let router = Arc::new(Router::new());
        let ln = ReverseTcpListener::new(
            format!("127.0.0.1:{port}").parse().unwrap(),
            router,
        );
        let accept = tokio::spawn(async move {
            let (mut stream, _meta) = ln.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"seen!").await.unwrap();
            ln
        });

        // give the reverse listener time to bind
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let mut client = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"seen!");

        let ln = accept.await.unwrap();
        ln.close();
    }

    #[tokio::test]
    async fn close_unblocks_accept() {
        let router = Arc::new(Router::new());
        let ln = Arc::new(ReverseTcpListener::new(
            "127.0.0.1:0".parse().unwrap(),
            router,
        ));
        let ln2 = ln.clone();
        let accept = tokio::spawn(async move { ln2.accept().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        ln.close();
        let err = tokio::time::timeout(std::time::Duration::from_secs(1), accept)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_closed());
    }
}
