//! Node selection strategies.
//!
//! All strategies pick among live nodes (marker deadline expired or
//! never set). When every candidate is dead, the one whose deadline
//! expires soonest is returned so traffic probes the least-recently
//! failed peer first.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::node::Node;

/// Per-hop node picker. Stateless over `(nodes, now)` apart from the
/// round-robin cursor.
pub trait Selector: Send + Sync {
    fn select(&self, nodes: &[Arc<Node>]) -> Option<Arc<Node>>;
}

/// Strategy identifier used in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
    Fifo,
}

impl Strategy {
    /// Parse a config name; unknown names fall back to round-robin.
    pub fn parse(name: &str) -> Self {
        match name {
            "rand" | "random" => Strategy::Random,
            "fifo" => Strategy::Fifo,
            _ => Strategy::RoundRobin,
        }
    }

    pub fn build(self) -> Arc<dyn Selector> {
        match self {
            Strategy::RoundRobin => Arc::new(RoundRobin::new()),
            Strategy::Random => Arc::new(Random),
            Strategy::Fifo => Arc::new(Fifo),
        }
    }
}

/// Live candidates, or the retry-soonest dead node when none are live.
fn live_or_soonest(nodes: &[Arc<Node>]) -> Vec<&Arc<Node>> {
    let live: Vec<&Arc<Node>> = nodes.iter().filter(|n| !n.marker().is_dead()).collect();
    if !live.is_empty() {
        return live;
    }
    nodes
        .iter()
        .min_by_key(|n| n.marker().dead_until_ms())
        .into_iter()
        .collect()
}

/// Cycles through the candidates sequentially.
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for RoundRobin {
    fn select(&self, nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
        let candidates = live_or_soonest(nodes);
        if candidates.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[i].clone())
    }
}

/// Uniform pick among the candidates.
pub struct Random;

impl Selector for Random {
    fn select(&self, nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
        let candidates = live_or_soonest(nodes);
        if candidates.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[i].clone())
    }
}

/// First live candidate, in declaration order.
pub struct Fifo;

impl Selector for Fifo {
    fn select(&self, nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
        live_or_soonest(nodes).first().map(|n| (*n).clone())
    }
}
