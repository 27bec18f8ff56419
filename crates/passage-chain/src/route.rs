//! Per-request route execution.

use std::sync::Arc;

use tracing::debug;

use passage_core::addr::{Address, Network};
use passage_core::contract::{Dialer, Listener, Stream};
use passage_core::error::Result;
use passage_transport::dialer::{TcpDialer, UdpDialer};
use passage_transport::listener::{TcpStreamListener, UdpSessionListener};

use crate::node::Node;

/// A concrete ordered node list derived from a chain for one request.
/// Used once, then discarded. Immutable after creation.
pub struct Route {
    nodes: Vec<Arc<Node>>,
}

impl Route {
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        Self { nodes }
    }

    /// The empty (direct) route.
    pub fn direct() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn last(&self) -> Option<&Arc<Node>> {
        self.nodes.last()
    }

    /// `name@addr` per hop, for route logging.
    pub fn describe(&self) -> String {
        self.nodes
            .iter()
            .map(|n| format!("{}@{}", n.name(), n.addr()))
            .collect::<Vec<_>>()
            .join(" > ")
    }

    /// Build the layered connection to the chain end, hop by hop.
    ///
    /// Hop 0 is dialed directly; every further hop is reached through
    /// the previous hop's connector, then runs its own dialer and
    /// connector handshakes over the tunneled stream. The failing hop's
    /// node is marked and the error propagates unchanged; whoever held
    /// the partial connection at failure has already dropped it.
    pub async fn connect(&self) -> Result<Stream> {
        let mut hops = self.nodes.iter();
        let Some(first) = hops.next() else {
            return Err(passage_core::error::Error::Protocol("empty route".into()));
        };

        let mut stream = match first.dialer().dial(first.addr()).await {
            Ok(s) => s,
            Err(e) => {
                first.marker().mark();
                return Err(e);
            }
        };
        stream = match Self::handshake_hop(first, stream).await {
            Ok(s) => s,
            Err(e) => return Err(e),
        };

        let mut prev = first;
        for node in hops {
            stream = match prev.connector().connect(stream, Network::Tcp, node.addr()).await {
                Ok(s) => s,
                Err(e) => {
                    node.marker().mark();
                    return Err(e);
                }
            };
            stream = Self::handshake_hop(node, stream).await?;
            prev = node;
        }
        Ok(stream)
    }

    /// Dialer handshake then connector handshake for one hop; marks the
    /// node on failure, resets it on success.
    async fn handshake_hop(node: &Arc<Node>, stream: Stream) -> Result<Stream> {
        let stream = match node.dialer().handshake(stream, node.addr()).await {
            Ok(s) => s,
            Err(e) => {
                node.marker().mark();
                return Err(e);
            }
        };
        match node.connector().handshake(stream).await {
            Ok(s) => {
                node.marker().reset();
                Ok(s)
            }
            Err(e) => {
                node.marker().mark();
                Err(e)
            }
        }
    }

    /// Open a connection to `target` through the chain, or directly when
    /// the route is empty.
    pub async fn dial(&self, network: Network, target: &Address) -> Result<Stream> {
        if self.is_empty() {
            return dial_direct(network, target).await;
        }
        let stream = self.connect().await?;
        // connect() errors on an empty node list, so last() is present
        let last = &self.nodes[self.nodes.len() - 1];
        debug!(target = %target, route = %self.describe(), "chain connected");
        last.connector().connect(stream, network, target).await
    }

    /// Open a listener on `addr`: local for the empty route, remote (via
    /// the last hop's connector) otherwise.
    pub async fn bind(&self, network: Network, addr: &Address) -> Result<Box<dyn Listener>> {
        if self.is_empty() {
            return bind_local(network, addr).await;
        }
        let stream = self.connect().await?;
        let last = &self.nodes[self.nodes.len() - 1];
        last.connector().bind(stream, network, addr).await
    }
}

async fn dial_direct(network: Network, target: &Address) -> Result<Stream> {
    match network {
        Network::Tcp => TcpDialer::default().dial(target).await,
        Network::Udp => UdpDialer::default().dial(target).await,
    }
}

async fn bind_local(network: Network, addr: &Address) -> Result<Box<dyn Listener>> {
    let addr = addr.to_string();
    match network {
        Network::Tcp => Ok(Box::new(TcpStreamListener::bind(&addr).await?)),
        Network::Udp => Ok(Box::new(UdpSessionListener::bind(&addr).await?)),
    }
}
