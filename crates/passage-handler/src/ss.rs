//! Shadowsocks ingress handler.
//!
//! Authentication is implicit: a client with the wrong password cannot
//! produce chunks that open, and the connection dies on the first
//! frame.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use passage_chain::Router;
use passage_connector::socks;
use passage_connector::ss::{KEY_LEN, codec::AeadStream, derive_master_key};
use passage_core::addr::Network;
use passage_core::contract::{Bypass, ConnMeta, Handler, Stream};
use passage_core::error::{Error, Result};
use passage_core::io::relay_streams;

use crate::{HandlerOptions, RelaySettings};

pub struct SsHandler {
    router: Arc<Router>,
    bypass: Option<Arc<dyn Bypass>>,
    settings: RelaySettings,
    master: [u8; KEY_LEN],
}

impl SsHandler {
    pub fn new(opts: &HandlerOptions) -> Result<Self> {
        // the shadowsocks secret travels as handler metadata; the
        // auther slot is not consulted
        let password = opts.metadata.get_string("password");
        if password.is_empty() {
            return Err(Error::Protocol("shadowsocks needs a password".into()));
        }
        Ok(Self {
            router: opts.router.clone(),
            bypass: opts.bypass.clone(),
            settings: RelaySettings::from_metadata(&opts.metadata),
            master: derive_master_key(&password),
        })
    }

    async fn serve(&self, stream: Stream, meta: ConnMeta) -> Result<()> {
        let mut stream: Stream = Box::new(AeadStream::new(stream, self.master));

        let target = tokio::time::timeout(
            self.settings.read_timeout,
            socks::read_addr(&mut stream),
        )
        .await
        .map_err(|_| Error::timeout("shadowsocks header read"))??;
        info!(peer = %meta.peer, target = %target, "shadowsocks request");

        if let Some(bypass) = &self.bypass {
            if bypass.contains(&target) {
                info!(peer = %meta.peer, target = %target, "bypass refused");
                return Ok(());
            }
        }

        let upstream = match self.router.dial(Network::Tcp, &target).await {
            Ok(s) => s,
            Err(e) => {
                warn!(peer = %meta.peer, target = %target, error = %e, "dial failed");
                return Err(e);
            }
        };

        let stats = relay_streams(
            stream,
            upstream,
            self.settings.buffer_size,
            self.settings.idle_timeout,
        )
        .await?;
        debug!(peer = %meta.peer, target = %target, bytes = stats.total(), "relay finished");
        Ok(())
    }
}

#[async_trait]
impl Handler for SsHandler {
    async fn handle(&self, stream: Stream, meta: ConnMeta) -> Result<()> {
        self.serve(stream, meta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passage_core::contract::{Connector, ConnectorOptions, Credentials};
    use passage_core::metadata::Metadata;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    fn handler(password: &str) -> SsHandler {
        let mut md = Metadata::new();
        md.set("password", password);
        let opts = HandlerOptions::new(Arc::new(Router::new())).with_metadata(md);
        SsHandler::new(&opts).unwrap()
    }

    #[tokio::test]
    async fn ss_connector_reaches_a_target_through_the_handler() {
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 6];
            s.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"we-in!");
            s.write_all(b"yes").await.unwrap();
        });

        let h = handler("hunter2");
        let (client_side, server_side) = duplex(65536);
        let served = tokio::spawn(async move {
            h.serve(
                Box::new(server_side),
                ConnMeta::new("127.0.0.1:9999".parse().unwrap()),
            )
            .await
        });

        // the client side is the ss connector over the same password
        let mut opts = ConnectorOptions::default();
        opts.auth = Some(Credentials::new("", "hunter2"));
        let connector = passage_connector::SsConnector::new(&opts).unwrap();
        let mut tunnel = connector
            .connect(
                Box::new(client_side),
                Network::Tcp,
                &target_addr.into(),
            )
            .await
            .unwrap();

        tunnel.write_all(b"we-in!").await.unwrap();
        tunnel.flush().await.unwrap();
        let mut buf = [0u8; 3];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"yes");

        drop(tunnel);
        served.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wrong_password_dies_on_the_first_frame() {
        let h = handler("right-password");
        let (client_side, server_side) = duplex(65536);
        let served = tokio::spawn(async move {
            h.serve(
                Box::new(server_side),
                ConnMeta::new("127.0.0.1:9999".parse().unwrap()),
            )
            .await
        });

        let mut opts = ConnectorOptions::default();
        opts.auth = Some(Credentials::new("", "wrong-password"));
        let connector = passage_connector::SsConnector::new(&opts).unwrap();
        let result = connector
            .connect(
                Box::new(client_side),
                Network::Tcp,
                &"1.2.3.4:80".parse().unwrap(),
            )
            .await;
        // connect itself may succeed (write buffered); the handler must
        // reject the stream
        drop(result);
        let err = served.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Io(_) | Error::Protocol(_)));
    }
}
