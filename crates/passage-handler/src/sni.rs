//! SNI peek handler.
//!
//! Peeks the first TLS record, routes by the ClientHello server name,
//! and replays the buffered bytes upstream. Connections that do not
//! open with a TLS handshake record restart as plain HTTP through the
//! embedded HTTP handler, with the consumed bytes fed back via a
//! prefix-buffer stream.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use passage_chain::Router;
use passage_connector::clienthello::{CONTENT_HANDSHAKE, RECORD_HEADER_LEN, parse_sni};
use passage_core::addr::{Address, Host, Network};
use passage_core::contract::{Bypass, ConnMeta, Handler, Stream};
use passage_core::error::{Error, Result};
use passage_core::io::{PrefixedStream, relay_streams};

use crate::http::HttpHandler;
use crate::{HandlerOptions, RelaySettings};

const MAX_RECORD_BYTES: usize = 16384 + RECORD_HEADER_LEN;

pub struct SniHandler {
    router: Arc<Router>,
    bypass: Option<Arc<dyn Bypass>>,
    settings: RelaySettings,
    http: HttpHandler,
}

impl SniHandler {
    pub fn new(opts: &HandlerOptions) -> Self {
        // the embedded HTTP handler accepts origin-form requests
        let mut http_opts = opts.clone();
        http_opts.metadata.set("sni", true);
        Self {
            router: opts.router.clone(),
            bypass: opts.bypass.clone(),
            settings: RelaySettings::from_metadata(&opts.metadata),
            http: HttpHandler::new(&http_opts),
        }
    }

    async fn serve(&self, mut stream: Stream, meta: ConnMeta) -> Result<()> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        tokio::time::timeout(self.settings.read_timeout, stream.read_exact(&mut header))
            .await
            .map_err(|_| Error::timeout("record header read"))??;

        if header[0] != CONTENT_HANDSHAKE {
            // not TLS: restart the flow as HTTP, replaying the peeked
            // bytes
            debug!(peer = %meta.peer, "first byte is not a handshake record, http fallback");
            let replay: Stream = Box::new(PrefixedStream::new(header.to_vec(), stream));
            return self.http.handle(replay, meta).await;
        }

        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if RECORD_HEADER_LEN + record_len > MAX_RECORD_BYTES {
            return Err(Error::Protocol("oversized handshake record".into()));
        }
        let mut record = vec![0u8; RECORD_HEADER_LEN + record_len];
        record[..RECORD_HEADER_LEN].copy_from_slice(&header);
        tokio::time::timeout(
            self.settings.read_timeout,
            stream.read_exact(&mut record[RECORD_HEADER_LEN..]),
        )
        .await
        .map_err(|_| Error::timeout("client hello read"))??;

        let Some(host) = parse_sni(&record) else {
            return Err(Error::Protocol("client hello carries no sni".into()));
        };
        let target = Address::new(Host::Domain(host), 443);
        info!(peer = %meta.peer, target = %target, "sni request");

        if let Some(bypass) = &self.bypass {
            if bypass.contains(&target) {
                info!(peer = %meta.peer, target = %target, "bypass refused");
                return Ok(());
            }
        }

        let mut upstream = match self.router.dial(Network::Tcp, &target).await {
            Ok(s) => s,
            Err(e) => {
                warn!(peer = %meta.peer, target = %target, error = %e, "dial failed");
                return Err(e);
            }
        };
        upstream.write_all(&record).await?;
        upstream.flush().await?;

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
impl Handler for SniHandler {
    async fn handle(&self, stream: Stream, meta: ConnMeta) -> Result<()> {
        self.serve(stream, meta).await
    }
}
