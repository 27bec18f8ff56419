//! Hop chains and routing.
//!
//! A [`Chain`] is an ordered sequence of [`Hop`]s; each hop holds one or
//! more candidate [`Node`]s and a selection strategy. Per request the
//! chain yields a [`Route`] — one node per hop, fixed at construction —
//! which executes the multi-hop connect. The [`Router`] wraps routes
//! with retries, name resolution and the UDP adapter.

pub mod chain;
pub mod marker;
pub mod node;
pub mod route;
pub mod router;
pub mod selector;

#[cfg(test)]
mod test_support;

pub use chain::Chain;
pub use marker::Marker;
pub use node::{Hop, Node};
pub use route::Route;
pub use router::Router;
pub use selector::{Selector, Strategy};
