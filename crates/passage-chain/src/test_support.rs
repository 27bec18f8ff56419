//! Shared stubs for chain unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use passage_core::addr::{Address, Network};
use passage_core::contract::{Connector, Dialer, Stream};
use passage_core::error::{Error, Result};

use crate::node::Node;

/// Dialer that counts calls and either fails or hands out one side of an
/// in-memory pipe.
pub struct StubDialer {
    calls: AtomicUsize,
    fail: bool,
}

impl StubDialer {
    pub fn ok() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Dialer for StubDialer {
    async fn dial(&self, addr: &Address) -> Result<Stream> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.fail {
            return Err(Error::Unavailable(format!("stub dial {addr}")));
        }
        let (near, _far) = tokio::io::duplex(256);
        Ok(Box::new(near))
    }
}

/// Connector that passes the hop connection through and records targets.
#[derive(Default)]
pub struct StubConnector {
    connects: AtomicUsize,
}

impl StubConnector {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self, stream: Stream, _network: Network, _target: &Address) -> Result<Stream> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(stream)
    }
}

pub fn null_node(name: &str) -> Node {
    Node::new(
        name,
        "127.0.0.1:1".parse().unwrap(),
        Arc::new(StubDialer::ok()),
        Arc::new(StubConnector::default()),
    )
}

pub fn node_with(name: &str, dialer: Arc<StubDialer>, connector: Arc<StubConnector>) -> Node {
    Node::new(name, "127.0.0.1:1".parse().unwrap(), dialer, connector)
}
