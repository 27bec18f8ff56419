//! TLS dialer: TCP plus a client handshake in the handshake step.

use async_trait::async_trait;
use tokio_rustls::TlsConnector;
use tracing::debug;

use passage_core::addr::Address;
use passage_core::contract::{Dialer, DialerOptions, Stream};
use passage_core::error::Result;

use super::tcp::TcpDialer;
use crate::tls::TlsClientSetup;

/// TCP transport with a TLS client handshake layered on in
/// [`Dialer::handshake`], so mid-chain hops can run their TLS over an
/// already-tunneled stream.
///
/// Metadata: the TCP keys plus `serverName`, `secure`, `caFile`, `alpn`.
pub struct TlsDialer {
    tcp: TcpDialer,
    tls: TlsClientSetup,
}

impl TlsDialer {
    pub fn new(opts: &DialerOptions) -> Result<Self> {
        Ok(Self {
            tcp: TcpDialer::new(opts),
            tls: TlsClientSetup::from_metadata(&opts.metadata)?,
        })
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, addr: &Address) -> Result<Stream> {
        self.tcp.dial(addr).await
    }

    async fn handshake(&self, stream: Stream, addr: &Address) -> Result<Stream> {
        let name = self.tls.name_for(&addr.host_str())?;
        let connector = TlsConnector::from(self.tls.config.clone());
        let tls = connector.connect(name, stream).await?;
        debug!(remote = %addr, "tls handshake complete");
        Ok(Box::new(tls))
    }
}
