//! HTTP/2 dialer: one shared connection per hop address, one CONNECT
//! stream per dial.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use h2::client::SendRequest;
use http::Request;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use passage_core::addr::Address;
use passage_core::contract::{Dialer, DialerOptions, Stream};
use passage_core::error::{Error, Result};

use super::tcp::TcpDialer;
use crate::stream::H2Io;
use crate::tls::TlsClientSetup;

/// Multiplexed HTTP/2 transport.
///
/// `dial` returns a logical CONNECT stream; the underlying connection is
/// created on first use and cached per hop address. A cached session
/// that stopped accepting streams is evicted and redialed. The lock is
/// held only across lookup and insert; concurrent dials may briefly
/// race to create a session, and the last insert wins.
///
/// Metadata: the TCP keys plus the TLS client keys; `plaintext` selects
/// h2c over plain TCP.
pub struct H2Dialer {
    tcp: TcpDialer,
    tls: Option<TlsClientSetup>,
    sessions: Mutex<HashMap<String, SendRequest<Bytes>>>,
}

impl H2Dialer {
    pub fn new(opts: &DialerOptions) -> Result<Self> {
        let md = &opts.metadata;
        let tls = if md.get_bool("plaintext") {
            None
        } else {
            let mut md = md.clone();
            if md.get_str_list("alpn").is_empty() {
                md.set("alpn", serde_json::json!(["h2"]));
            }
            Some(TlsClientSetup::from_metadata(&md)?)
        };
        Ok(Self {
            tcp: TcpDialer::new(opts),
            tls,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    async fn open_session(&self, addr: &Address) -> Result<SendRequest<Bytes>> {
        let tcp = self.tcp.connect(addr).await?;
        let stream: Stream = match &self.tls {
            Some(tls) => {
                let name = tls.name_for(&addr.host_str())?;
                let connector = TlsConnector::from(tls.config.clone());
                Box::new(connector.connect(name, tcp).await?)
            }
            None => Box::new(tcp),
        };

        let (send_request, connection) = h2::client::handshake(stream)
            .await
            .map_err(|e| Error::Unavailable(format!("h2 handshake {addr}: {e}")))?;
        let peer = addr.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(peer = %peer, error = %e, "h2 connection ended");
            }
        });
        debug!(remote = %addr, "h2 session established");
        Ok(send_request)
    }

    async fn open_stream(&self, sr: SendRequest<Bytes>, addr: &Address) -> Result<Stream> {
        let mut sr = sr
            .ready()
            .await
            .map_err(|e| Error::Unavailable(format!("h2 session {addr}: {e}")))?;

        let uri = http::Uri::try_from(addr.to_string())
            .map_err(|e| Error::Protocol(format!("h2 authority {addr}: {e}")))?;
        let request = Request::connect(uri)
            .body(())
            .map_err(|e| Error::Protocol(format!("h2 request: {e}")))?;

        let (response, send) = sr
            .send_request(request, false)
            .map_err(|e| Error::Unavailable(format!("h2 stream {addr}: {e}")))?;
        let response = response
            .await
            .map_err(|e| Error::Unavailable(format!("h2 connect {addr}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Unavailable(format!(
                "h2 connect {addr}: status {}",
                response.status()
            )));
        }
        Ok(Box::new(H2Io::new(send, response.into_body())))
    }
}

#[async_trait]
impl Dialer for H2Dialer {
    async fn dial(&self, addr: &Address) -> Result<Stream> {
        let key = addr.to_string();

        let cached = { self.sessions.lock().await.get(&key).cloned() };
        if let Some(sr) = cached {
            match self.open_stream(sr, addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    // session went away underneath us
                    debug!(remote = %addr, error = %e, "evicting dead h2 session");
                    self.sessions.lock().await.remove(&key);
                }
            }
        }

        let sr = self.open_session(addr).await?;
        self.sessions.lock().await.insert(key, sr.clone());
        self.open_stream(sr, addr).await
    }

    fn multiplex(&self) -> bool {
        true
    }
}
