//! Component contracts of the connection pipeline.
//!
//! Each component is a small capability set: a primary operation plus
//! optional capabilities expressed as default trait methods (`handshake`,
//! `bind`, `multiplex`). Connections are trait objects; every wrapper
//! owns its inner stream exclusively, so dropping the outermost layer
//! closes the whole stack.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::addr::{Address, Network};
use crate::error::{Error, Result};
use crate::metadata::Metadata;

/// Marker for byte streams the pipeline can relay.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

/// A layered connection. Created by a [`Dialer`], possibly re-wrapped by
/// handshakes, layered again by each [`Connector::connect`] along a chain.
pub type Stream = Box<dyn AsyncReadWrite>;

/// User credentials carried by dialer/connector/handler options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Options handed to dialer factories.
#[derive(Debug, Clone, Default)]
pub struct DialerOptions {
    pub auth: Option<Credentials>,
    pub metadata: Metadata,
}

/// Options handed to connector factories.
#[derive(Debug, Clone, Default)]
pub struct ConnectorOptions {
    pub auth: Option<Credentials>,
    pub metadata: Metadata,
}

/// Opens a raw transport connection to one hop.
///
/// Constructors parse their [`Metadata`] up front and do no I/O; `dial`
/// opens the transport. A dialer that needs a post-dial setup step (TLS,
/// WebSocket upgrade, HTTP/2 preface) implements `handshake`, which must
/// run exactly once per hop before the connection is used.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &Address) -> Result<Stream>;

    /// Optional capability: post-dial setup that may replace the
    /// connection with a wrapped one.
    async fn handshake(&self, stream: Stream, addr: &Address) -> Result<Stream> {
        let _ = addr;
        Ok(stream)
    }

    /// Whether `dial` returns logical streams over a shared session.
    fn multiplex(&self) -> bool {
        false
    }
}

/// Runs a tunneling protocol over an already-open hop connection.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Optional capability: the tunnel protocol's own handshake with the
    /// hop (e.g. SOCKS5 method negotiation). Run once per hop connection;
    /// a second invocation must not succeed cleanly.
    async fn handshake(&self, stream: Stream) -> Result<Stream> {
        Ok(stream)
    }

    /// Ask the hop to open a logical connection to `target` and return
    /// the stream whose reads and writes now reach that target.
    async fn connect(&self, stream: Stream, network: Network, target: &Address) -> Result<Stream>;

    /// Optional capability: ask the hop to open a remote listener.
    async fn bind(
        &self,
        stream: Stream,
        network: Network,
        addr: &Address,
    ) -> Result<Box<dyn Listener>> {
        let _ = (stream, network, addr);
        Err(Error::Unsupported("bind"))
    }
}

/// What a listener knows about an accepted connection beyond the bytes.
#[derive(Debug, Clone, Copy)]
pub struct ConnMeta {
    pub peer: SocketAddr,
    /// Accept-side address, when the transport has one.
    pub local: Option<SocketAddr>,
    /// Pre-NAT destination recovered from the socket (transparent
    /// redirect).
    pub original_dst: Option<SocketAddr>,
}

impl ConnMeta {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            local: None,
            original_dst: None,
        }
    }

    pub fn with_local(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_original_dst(mut self, dst: SocketAddr) -> Self {
        self.original_dst = Some(dst);
        self
    }
}

/// Accepts inbound transport connections; the inverse of [`Dialer`].
///
/// Listeners over multiplexed transports demultiplex internally and
/// deliver each logical stream as a separate `accept` result, dropping
/// new streams when their bounded queue is full.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Next inbound connection. Returns [`Error::Closed`] after `close`.
    async fn accept(&self) -> Result<(Stream, ConnMeta)>;

    fn local_addr(&self) -> Result<SocketAddr>;

    /// Stop accepting. Idempotent; pending and future `accept` calls
    /// return [`Error::Closed`].
    fn close(&self);
}

/// Per-ingress-protocol state machine.
///
/// `handle` takes ownership of the connection; dropping it on any path
/// closes the transport.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, stream: Stream, meta: ConnMeta) -> Result<()>;
}

/// Credential check consulted by handlers.
#[async_trait]
pub trait Auther: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// Allow/deny predicate over destination host strings.
pub trait Bypass: Send + Sync {
    /// True when the target must be refused.
    fn contains(&self, addr: &Address) -> bool;
}

/// Asynchronous name resolution.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Static hostname overrides consulted before the resolver.
pub trait HostMapper: Send + Sync {
    fn lookup(&self, host: &str) -> Option<IpAddr>;
}
