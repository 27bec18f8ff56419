//! Chain nodes and hops.

use std::sync::Arc;

use passage_core::addr::Address;
use passage_core::contract::{Bypass, Connector, Dialer};

use crate::marker::Marker;
use crate::selector::{Selector, Strategy};

/// One upstream peer reachable through exactly one dialer/connector
/// pair. Shared read-only across requests; only the marker mutates.
pub struct Node {
    name: String,
    addr: Address,
    dialer: Arc<dyn Dialer>,
    connector: Arc<dyn Connector>,
    marker: Marker,
    bypass: Option<Arc<dyn Bypass>>,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        addr: Address,
        dialer: Arc<dyn Dialer>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            name: name.into(),
            addr,
            dialer,
            connector,
            marker: Marker::default(),
            bypass: None,
        }
    }

    pub fn with_marker(mut self, marker: Marker) -> Self {
        self.marker = marker;
        self
    }

    pub fn with_bypass(mut self, bypass: Arc<dyn Bypass>) -> Self {
        self.bypass = Some(bypass);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }

    pub fn dialer(&self) -> &Arc<dyn Dialer> {
        &self.dialer
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn marker(&self) -> &Marker {
        &self.marker
    }

    /// True when this node's own bypass rejects the target.
    pub fn bypassed(&self, target: &Address) -> bool {
        self.bypass.as_ref().is_some_and(|b| b.contains(target))
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("addr", &self.addr.to_string())
            .field("dead", &self.marker.is_dead())
            .finish()
    }
}

/// One routing decision point: a non-empty candidate set plus the
/// strategy that picks one node per request.
pub struct Hop {
    name: String,
    nodes: Vec<Arc<Node>>,
    selector: Arc<dyn Selector>,
}

impl Hop {
    pub fn new(name: impl Into<String>, nodes: Vec<Arc<Node>>) -> Self {
        Self::with_strategy(name, nodes, Strategy::RoundRobin)
    }

    pub fn with_strategy(
        name: impl Into<String>,
        nodes: Vec<Arc<Node>>,
        strategy: Strategy,
    ) -> Self {
        Self {
            name: name.into(),
            nodes,
            selector: strategy.build(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Pick one node for a request.
    pub fn select(&self) -> Option<Arc<Node>> {
        self.selector.select(&self.nodes)
    }
}
