//! Ordered hop composition.

use std::sync::Arc;

use passage_core::addr::{Address, Network};

use crate::node::Hop;
use crate::route::Route;

/// Ordered sequence of hops. Hop `i`'s selected node is connected
/// *through* hops `0..i`. An empty chain means direct.
///
/// Built once from configuration and shared read-only by every
/// concurrent request; failure tracking lives in the node markers.
#[derive(Default)]
pub struct Chain {
    name: String,
    hops: Vec<Hop>,
}

impl Chain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hops: Vec::new(),
        }
    }

    pub fn add_hop(mut self, hop: Hop) -> Self {
        self.hops.push(hop);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    /// Derive a route for one request: one node per hop, fixed at
    /// construction. Pure over `(chain, target, marker state)` — no side
    /// effects; marking happens later when the route runs.
    ///
    /// A hop whose selected node has a bypass matching the target is
    /// skipped, so per-node bypasses carve direct exits out of a chain.
    pub fn get_route(&self, _network: Network, target: &Address) -> Route {
        let mut nodes = Vec::with_capacity(self.hops.len());
        for hop in &self.hops {
            let Some(node) = hop.select() else {
                continue;
            };
            if node.bypassed(target) {
                continue;
            }
            nodes.push(node);
        }
        Route::new(nodes)
    }
}

/// Shared handle used by routers and reverse listeners.
pub type SharedChain = Arc<Chain>;
