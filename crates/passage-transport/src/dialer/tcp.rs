//! Plain TCP dialer.

use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::debug;

use passage_core::addr::Address;
use passage_core::contract::{Dialer, DialerOptions, Stream};
use passage_core::defaults::DEFAULT_DIAL_TIMEOUT;
use passage_core::error::{Error, Result};

/// Thin wrapper over the OS socket API.
///
/// Metadata: `timeout` (connect timeout), `nodelay` (default on),
/// `keepAlive` (interval; zero disables).
pub struct TcpDialer {
    timeout: Duration,
    nodelay: bool,
    keepalive: Duration,
}

impl TcpDialer {
    pub fn new(opts: &DialerOptions) -> Self {
        let md = &opts.metadata;
        let timeout = md.get_duration("timeout");
        Self {
            timeout: if timeout.is_zero() { DEFAULT_DIAL_TIMEOUT } else { timeout },
            nodelay: !md.contains("nodelay") || md.get_bool("nodelay"),
            keepalive: md.get_duration("keepAlive"),
        }
    }

    pub(crate) fn apply_socket_options(&self, stream: &TcpStream) -> Result<()> {
        stream.set_nodelay(self.nodelay)?;
        if !self.keepalive.is_zero() {
            let sock = SockRef::from(stream);
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(self.keepalive))?;
        }
        Ok(())
    }

    pub(crate) async fn connect(&self, addr: &Address) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr.to_string()))
            .await
            .map_err(|_| Error::timeout("tcp connect"))?
            .map_err(|e| Error::Unavailable(format!("connect {addr}: {e}")))?;
        self.apply_socket_options(&stream)?;
        debug!(remote = %addr, "tcp connected");
        Ok(stream)
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(&DialerOptions::default())
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &Address) -> Result<Stream> {
        Ok(Box::new(self.connect(addr).await?))
    }
}
