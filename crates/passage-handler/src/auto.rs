//! Protocol-sniffing handler.
//!
//! Default ingress when the scheme does not name a protocol: the first
//! byte picks SOCKS4 (0x04), SOCKS5 (0x05) or HTTP, and the consumed
//! byte is replayed to the chosen handler.

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::debug;

use passage_core::contract::{ConnMeta, Handler, Stream};
use passage_core::error::Result;
use passage_core::io::PrefixedStream;

use crate::http::HttpHandler;
use crate::socks4::Socks4Handler;
use crate::socks5::Socks5Handler;
use crate::HandlerOptions;

pub struct AutoHandler {
    http: HttpHandler,
    socks4: Socks4Handler,
    socks5: Socks5Handler,
}

impl AutoHandler {
    pub fn new(opts: &HandlerOptions) -> Self {
        Self {
            http: HttpHandler::new(opts),
            socks4: Socks4Handler::new(opts),
            socks5: Socks5Handler::new(opts),
        }
    }
}

#[async_trait]
impl Handler for AutoHandler {
    async fn handle(&self, mut stream: Stream, meta: ConnMeta) -> Result<()> {
        let first = stream.read_u8().await?;
        let replay: Stream = Box::new(PrefixedStream::new(vec![first], stream));
        match first {
            0x04 => {
                debug!(peer = %meta.peer, "sniffed socks4");
                self.socks4.handle(replay, meta).await
            }
            0x05 => {
                debug!(peer = %meta.peer, "sniffed socks5");
                self.socks5.handle(replay, meta).await
            }
            _ => {
                debug!(peer = %meta.peer, "sniffed http");
                self.http.handle(replay, meta).await
            }
        }
    }
}
