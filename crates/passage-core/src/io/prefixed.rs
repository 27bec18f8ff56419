//! Prefix replay for protocol sniffing.
//!
//! Handlers that peek at the first bytes of a connection (SNI, auto)
//! re-wrap it in a [`PrefixedStream`] so the consumed bytes are served
//! again before reads reach the inner transport.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Serves `prefix` first, then delegates to the inner stream. Writes
/// pass straight through.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let rest = &self.prefix[self.pos..];
            let n = rest.len().min(buf.remaining());
            buf.put_slice(&rest[..n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn replays_prefix_before_inner_bytes() {
        let (mut client, server) = duplex(64);
        let mut wrapped = PrefixedStream::new(&b"\x16\x03\x01"[..], server);

        client.write_all(b"rest").await.unwrap();
        drop(client);

        let mut all = Vec::new();
        wrapped.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"\x16\x03\x01rest");
    }

    #[tokio::test]
    async fn short_reads_drain_the_prefix_incrementally() {
        let (_client, server) = duplex(64);
        let mut wrapped = PrefixedStream::new(&b"abcdef"[..], server);

        let mut buf = [0u8; 4];
        let n = wrapped.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = wrapped.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn writes_bypass_the_prefix() {
        let (mut client, server) = duplex(64);
        let mut wrapped = PrefixedStream::new(&b"unused"[..], server);

        wrapped.write_all(b"direct").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"direct");
    }
}
