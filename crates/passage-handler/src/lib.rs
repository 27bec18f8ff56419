//! Ingress protocol handlers.
//!
//! One handler per front-end protocol. The common shape: parse the
//! client greeting, authenticate, extract the target, consult the
//! bypass, answer per protocol, dial through the router, relay.

pub mod auto;
pub mod forward;
pub mod http;
pub mod redirect;
pub mod sni;
pub mod socks4;
pub mod socks5;
pub mod ss;

use std::sync::Arc;
use std::time::Duration;

use passage_chain::Router;
use passage_core::contract::{Auther, Bypass};
use passage_core::defaults::{DEFAULT_HANDSHAKE_READ_TIMEOUT, DEFAULT_RELAY_BUFFER_SIZE};
use passage_core::metadata::Metadata;

pub use auto::AutoHandler;
pub use forward::ForwardHandler;
pub use http::HttpHandler;
pub use redirect::RedirectHandler;
pub use sni::SniHandler;
pub use socks4::Socks4Handler;
pub use socks5::Socks5Handler;
pub use ss::SsHandler;

/// Everything a handler factory needs.
#[derive(Clone)]
pub struct HandlerOptions {
    pub router: Arc<Router>,
    pub auther: Option<Arc<dyn Auther>>,
    pub bypass: Option<Arc<dyn Bypass>>,
    pub metadata: Metadata,
}

impl HandlerOptions {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            auther: None,
            bypass: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_auther(mut self, auther: Arc<dyn Auther>) -> Self {
        self.auther = Some(auther);
        self
    }

    pub fn with_bypass(mut self, bypass: Arc<dyn Bypass>) -> Self {
        self.bypass = Some(bypass);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Relay knobs shared by every handler.
///
/// Metadata: `readTimeout` (initial greeting read), `bufferSize`,
/// `idleTimeout` (unset means no idle limit).
#[derive(Debug, Clone, Copy)]
pub(crate) struct RelaySettings {
    pub read_timeout: Duration,
    pub buffer_size: usize,
    pub idle_timeout: Option<Duration>,
}

impl RelaySettings {
    pub fn from_metadata(md: &Metadata) -> Self {
        let read_timeout = md.get_duration("readTimeout");
        let buffer_size = md.get_int("bufferSize");
        let idle_timeout = md.get_duration("idleTimeout");
        Self {
            read_timeout: if read_timeout.is_zero() {
                DEFAULT_HANDSHAKE_READ_TIMEOUT
            } else {
                read_timeout
            },
            buffer_size: if buffer_size <= 0 {
                DEFAULT_RELAY_BUFFER_SIZE
            } else {
                buffer_size as usize
            },
            idle_timeout: if idle_timeout.is_zero() {
                None
            } else {
                Some(idle_timeout)
            },
        }
    }
}
