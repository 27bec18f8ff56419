//! WebSocket dialer.

use async_trait::async_trait;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::client_async;
use tracing::debug;

use passage_core::addr::Address;
use passage_core::contract::{Dialer, DialerOptions, Stream};
use passage_core::error::{Error, Result};

use super::tcp::TcpDialer;
use crate::stream::WsIo;
use crate::tls::TlsClientSetup;

/// TCP (optionally TLS) plus an HTTP/1.1 Upgrade to WebSocket at a
/// configured path; binary frames carry the byte stream.
///
/// Metadata: the TCP keys plus `path` (default `/`), `host` (Host
/// header override), and the TLS client keys when built for `wss`.
pub struct WsDialer {
    tcp: TcpDialer,
    tls: Option<TlsClientSetup>,
    path: String,
    host: Option<String>,
}

impl WsDialer {
    pub fn new(opts: &DialerOptions) -> Result<Self> {
        Self::build(opts, false)
    }

    /// `wss`: TLS below the upgrade.
    pub fn new_secure(opts: &DialerOptions) -> Result<Self> {
        Self::build(opts, true)
    }

    fn build(opts: &DialerOptions, secure: bool) -> Result<Self> {
        let md = &opts.metadata;
        let path = match md.get_str("path") {
            "" => "/".to_string(),
            p => p.to_string(),
        };
        let host = match md.get_str("host") {
            "" => None,
            h => Some(h.to_string()),
        };
        Ok(Self {
            tcp: TcpDialer::new(opts),
            tls: secure.then(|| TlsClientSetup::from_metadata(md)).transpose()?,
            path,
            host,
        })
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, addr: &Address) -> Result<Stream> {
        self.tcp.dial(addr).await
    }

    async fn handshake(&self, stream: Stream, addr: &Address) -> Result<Stream> {
        let stream: Stream = match &self.tls {
            Some(tls) => {
                let name = tls.name_for(&addr.host_str())?;
                let connector = TlsConnector::from(tls.config.clone());
                Box::new(connector.connect(name, stream).await?)
            }
            None => stream,
        };

        let host = self.host.clone().unwrap_or_else(|| addr.to_string());
        let scheme = if self.tls.is_some() { "wss" } else { "ws" };
        let url = format!("{scheme}://{host}{}", self.path);

        let (ws, _resp) = client_async(&url, stream)
            .await
            .map_err(|e| Error::Unavailable(format!("ws upgrade {addr}: {e}")))?;
        debug!(remote = %addr, path = %self.path, "websocket established");
        Ok(Box::new(WsIo::new(ws)))
    }
}
