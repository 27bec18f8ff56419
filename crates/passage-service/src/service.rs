//! Accept loop.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use passage_core::contract::{Handler, Listener};
use passage_core::defaults::ACCEPT_RETRY_BACKOFF;

/// One listener bound to one handler.
///
/// Every accepted connection runs in its own task; the handler owns the
/// connection and drops it on return. Transient accept errors are
/// logged and retried after a short backoff; `Closed` ends the loop.
/// Cancelling the token closes the listener without draining in-flight
/// handlers — each handler is responsible for its own lifetime.
pub struct Service {
    name: String,
    listener: Arc<dyn Listener>,
    handler: Arc<dyn Handler>,
}

impl Service {
    pub fn new(
        name: impl Into<String>,
        listener: Arc<dyn Listener>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            name: name.into(),
            listener,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listener(&self) -> &Arc<dyn Listener> {
        &self.listener
    }

    /// Run until the listener closes or `shutdown` fires.
    pub async fn serve(&self, shutdown: CancellationToken) {
        match self.listener.local_addr() {
            Ok(addr) => info!(service = %self.name, address = %addr, "service started"),
            Err(_) => info!(service = %self.name, "service started"),
        }

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.listener.close();
                    break;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, meta)) => {
                    debug!(service = %self.name, peer = %meta.peer, "connection accepted");
                    let handler = self.handler.clone();
                    let service = self.name.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle(stream, meta).await {
                            debug!(service = %service, peer = %meta.peer, error = %e, "handler finished with error");
                        }
                    });
                }
                Err(e) if e.is_closed() => {
                    info!(service = %self.name, "listener closed");
                    break;
                }
                Err(e) => {
                    warn!(service = %self.name, error = %e, "accept failed, backing off");
                    tokio::time::sleep(ACCEPT_RETRY_BACKOFF).await;
                }
            }
        }
        info!(service = %self.name, "service stopped");
    }

    /// Spawn `serve` on the runtime.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.serve(shutdown).await;
        })
    }

    pub fn close(&self) {
        self.listener.close();
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.listener.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use passage_core::contract::{ConnMeta, Stream};
    use passage_core::error::Result;
    use passage_transport::TcpStreamListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct EchoHandler {
        served: AtomicUsize,
    }

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, mut stream: Stream, _meta: ConnMeta) -> Result<()> {
            self.served.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 64];
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                stream.write_all(&buf[..n]).await?;
            }
        }
    }

    #[tokio::test]
    async fn serves_concurrent_connections() {
        let listener = Arc::new(TcpStreamListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(EchoHandler {
            served: AtomicUsize::new(0),
        });
        let service = Arc::new(Service::new("echo", listener, handler.clone()));

        let shutdown = CancellationToken::new();
        let task = service.clone().spawn(shutdown.clone());

        let mut clients = Vec::new();
        for i in 0..3u8 {
            clients.push(tokio::spawn(async move {
                let mut c = tokio::net::TcpStream::connect(addr).await.unwrap();
                c.write_all(&[i; 4]).await.unwrap();
                let mut buf = [0u8; 4];
                c.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, [i; 4]);
            }));
        }
        for c in clients {
            c.await.unwrap();
        }
        assert_eq!(handler.served.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_the_accept_loop() {
        let listener = Arc::new(TcpStreamListener::bind("127.0.0.1:0").await.unwrap());
        let handler = Arc::new(EchoHandler {
            served: AtomicUsize::new(0),
        });
        let service = Arc::new(Service::new("stoppable", listener, handler));

        let shutdown = CancellationToken::new();
        let task = service.clone().spawn(shutdown.clone());
        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("accept loop must exit promptly")
            .unwrap();
    }
}
