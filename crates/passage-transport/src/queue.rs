//! Bounded accept queue for listeners that demultiplex internally.
//!
//! The producing accept task never blocks: when the queue is full, new
//! streams are dropped (closed) with a warning. Backpressure by
//! discard keeps a slow consumer from wedging the transport.

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use passage_core::contract::{ConnMeta, Stream};
use passage_core::error::{Error, Result};

/// Consumer half, owned by the listener.
pub struct AcceptQueue {
    rx: Mutex<mpsc::Receiver<(Stream, ConnMeta)>>,
    token: CancellationToken,
}

/// Producer half, cloned into accept tasks.
#[derive(Clone)]
pub struct AcceptSender {
    tx: mpsc::Sender<(Stream, ConnMeta)>,
    token: CancellationToken,
}

/// Create a queue pair with the given bound.
pub fn accept_queue(size: usize) -> (AcceptQueue, AcceptSender) {
    let (tx, rx) = mpsc::channel(size.max(1));
    let token = CancellationToken::new();
    (
        AcceptQueue {
            rx: Mutex::new(rx),
            token: token.clone(),
        },
        AcceptSender { tx, token },
    )
}

impl AcceptQueue {
    /// Next queued stream; [`Error::Closed`] once the listener closed or
    /// every producer is gone.
    pub async fn recv(&self) -> Result<(Stream, ConnMeta)> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.token.cancelled() => Err(Error::Closed),
            item = rx.recv() => item.ok_or(Error::Closed),
        }
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token accept tasks watch so `close` stops them too.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl AcceptSender {
    /// Enqueue a freshly accepted stream; drops it when the queue is
    /// full or the listener closed.
    pub fn push(&self, stream: Stream, meta: ConnMeta) {
        if self.token.is_cancelled() {
            return;
        }
        let peer = meta.peer;
        if self.tx.try_send((stream, meta)).is_err() {
            warn!(peer = %peer, "accept queue full, dropping connection");
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn peer() -> SocketAddr {
        "127.0.0.1:1234".parse().unwrap()
    }

    fn dummy_stream() -> Stream {
        let (a, _b) = tokio::io::duplex(8);
        Box::new(a)
    }

    #[tokio::test]
    async fn queued_streams_come_back_out() {
        let (queue, sender) = accept_queue(4);
        sender.push(dummy_stream(), ConnMeta::new(peer()));
        let (_stream, meta) = queue.recv().await.unwrap();
        assert_eq!(meta.peer, peer());
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let (queue, sender) = accept_queue(2);
        for _ in 0..10 {
            // must never block even though nobody consumes
            sender.push(dummy_stream(), ConnMeta::new(peer()));
        }
        // only the queue bound survives
        queue.recv().await.unwrap();
        queue.recv().await.unwrap();
        queue.close();
        assert!(queue.recv().await.is_err());
    }

    #[tokio::test]
    async fn close_wakes_a_pending_recv() {
        let (queue, _sender) = accept_queue(1);
        let token = queue.token();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            token.cancel();
        });
        let err = queue.recv().await.unwrap_err();
        assert!(err.is_closed());
    }
}
