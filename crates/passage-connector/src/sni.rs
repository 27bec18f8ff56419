//! SNI rewriting connector.
//!
//! The hop is a plain TLS-peeking gateway: whatever server name the
//! first ClientHello carries decides where it forwards. This connector
//! therefore rewrites the first outgoing ClientHello's SNI (or an HTTP
//! Host header) to the routed target so the hop steers the stream
//! correctly; everything after the first flight passes through.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tracing::debug;

use passage_core::addr::{Address, Network};
use passage_core::contract::{Connector, ConnectorOptions, Stream};
use passage_core::error::{Error, Result};

use crate::clienthello;

pub struct SniConnector;

impl SniConnector {
    pub fn new(_opts: &ConnectorOptions) -> Self {
        Self
    }
}

#[async_trait]
impl Connector for SniConnector {
    async fn connect(&self, stream: Stream, network: Network, target: &Address) -> Result<Stream> {
        if network == Network::Udp {
            return Err(Error::Unsupported("udp over sni"));
        }
        debug!(target = %target, "sni rewrite armed");
        Ok(Box::new(SniRewriteStream {
            inner: stream,
            host: target.host_str(),
            first_write_done: false,
        }))
    }
}

/// Rewrites the first write when it looks like a ClientHello or an HTTP
/// request head; later writes pass through untouched.
struct SniRewriteStream {
    inner: Stream,
    host: String,
    first_write_done: bool,
}

impl SniRewriteStream {
    fn rewrite(&self, buf: &[u8]) -> Option<Vec<u8>> {
        if buf.first() == Some(&clienthello::CONTENT_HANDSHAKE) {
            return clienthello::rewrite_sni(buf, &self.host);
        }
        rewrite_http_host(buf, &self.host)
    }
}

/// Swap the Host header of a complete request head already in `buf`.
fn rewrite_http_host(buf: &[u8], host: &str) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(buf).ok()?;
    let head_end = text.find("\r\n\r\n")?;
    let mut out = String::with_capacity(text.len());
    let mut replaced = false;
    for line in text[..head_end].split("\r\n") {
        if let Some((name, _)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("host") {
                out.push_str(&format!("Host: {host}\r\n"));
                replaced = true;
                continue;
            }
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    if !replaced {
        return None;
    }
    out.push_str("\r\n");
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&buf[head_end + 4..]);
    Some(bytes)
}

impl tokio::io::AsyncRead for SniRewriteStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for SniRewriteStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.first_write_done {
            return Pin::new(&mut self.inner).poll_write(cx, buf);
        }
        match self.rewrite(buf) {
            Some(rewritten) => {
                // written whole or not at all, so the caller's offset
                // accounting stays in terms of the original buffer
                match Pin::new(&mut self.inner).poll_write(cx, &rewritten) {
                    Poll::Ready(Ok(n)) if n == rewritten.len() => {
                        self.first_write_done = true;
                        Poll::Ready(Ok(buf.len()))
                    }
                    Poll::Ready(Ok(_)) => Poll::Ready(Err(io::Error::other(
                        "short write during sni rewrite",
                    ))),
                    Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                    Poll::Pending => Poll::Pending,
                }
            }
            None => {
                self.first_write_done = true;
                Pin::new(&mut self.inner).poll_write(cx, buf)
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
