//! The project's own framed tunnel protocol.
//!
//! Request: `Version(1) | Flags(1) | FeatureCount(2)` followed by
//! feature TLVs (`Type(1) | Len(2) | Value`). Features: UserAuth (0x01,
//! value `ulen(1) user plen(1) password`) and TargetAddr (0x02, value
//! in SOCKS address encoding). Flags bit 0x01 selects UDP mode, in
//! which datagrams ride the stream with a 2-byte length prefix.
//! Response: `Version(1) | Status(1) | FeatureCount(2)`, status 0 = OK.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

use passage_core::addr::{Address, Network};
use passage_core::contract::{Connector, ConnectorOptions, Credentials, Stream};
use passage_core::error::{Error, Result};

use crate::socks;

pub const VERSION: u8 = 0x01;

pub const FLAG_UDP: u8 = 0x01;

pub const FEATURE_USER_AUTH: u8 = 0x01;
pub const FEATURE_TARGET_ADDR: u8 = 0x02;

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_AUTH_FAILED: u8 = 0x01;
pub const STATUS_REFUSED: u8 = 0x02;
pub const STATUS_FAILED: u8 = 0x03;

/// Client side of the relay protocol.
///
/// Metadata: `connectTimeout`.
pub struct RelayConnector {
    auth: Option<Credentials>,
    connect_timeout: Duration,
}

impl RelayConnector {
    pub fn new(opts: &ConnectorOptions) -> Self {
        Self {
            auth: opts.auth.clone(),
            connect_timeout: opts.metadata.get_duration("connectTimeout"),
        }
    }

    fn encode_request(&self, network: Network, target: &Address) -> Result<Vec<u8>> {
        let mut features: Vec<(u8, Vec<u8>)> = Vec::new();

        if let Some(auth) = &self.auth {
            if auth.username.len() > 255 || auth.password.len() > 255 {
                return Err(Error::Protocol("credentials too long".into()));
            }
            let mut value = vec![auth.username.len() as u8];
            value.extend_from_slice(auth.username.as_bytes());
            value.push(auth.password.len() as u8);
            value.extend_from_slice(auth.password.as_bytes());
            features.push((FEATURE_USER_AUTH, value));
        }

        let mut value = Vec::new();
        socks::encode_addr(&mut value, target)?;
        features.push((FEATURE_TARGET_ADDR, value));

        let flags = if network == Network::Udp { FLAG_UDP } else { 0 };
        let mut msg = vec![VERSION, flags];
        msg.extend_from_slice(&(features.len() as u16).to_be_bytes());
        for (ftype, value) in features {
            msg.push(ftype);
            msg.extend_from_slice(&(value.len() as u16).to_be_bytes());
            msg.extend_from_slice(&value);
        }
        Ok(msg)
    }

    async fn exchange(&self, mut stream: Stream, network: Network, target: &Address) -> Result<Stream> {
        let request = self.encode_request(network, target)?;
        stream.write_all(&request).await?;
        stream.flush().await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(Error::Protocol(format!("bad relay version {:#x}", head[0])));
        }
        // skip response features
        let feature_count = u16::from_be_bytes([head[2], head[3]]);
        for _ in 0..feature_count {
            let ftype = stream.read_u8().await?;
            let len = stream.read_u16().await? as usize;
            let mut value = vec![0u8; len];
            stream.read_exact(&mut value).await?;
            let _ = ftype;
        }

        match head[1] {
            STATUS_OK => {
                debug!(target = %target, udp = (network == Network::Udp), "relay tunnel opened");
                if network == Network::Udp {
                    Ok(Box::new(FramedUdpStream::new(stream)))
                } else {
                    Ok(stream)
                }
            }
            STATUS_AUTH_FAILED => Err(Error::Auth),
            STATUS_REFUSED => Err(Error::Refused(format!("relay refused {target}"))),
            status => Err(Error::Unavailable(format!("relay status {status:#x}"))),
        }
    }
}

#[async_trait]
impl Connector for RelayConnector {
    async fn connect(&self, stream: Stream, network: Network, target: &Address) -> Result<Stream> {
        if self.connect_timeout.is_zero() {
            return self.exchange(stream, network, target).await;
        }
        tokio::time::timeout(
            self.connect_timeout,
            self.exchange(stream, network, target),
        )
        .await
        .map_err(|_| Error::timeout("relay connect"))?
    }
}

/// Length-prefixed datagrams over a byte stream (UDP mode).
pub struct FramedUdpStream {
    inner: Stream,
    read_head: [u8; 2],
    read_head_pos: usize,
    read_body: Vec<u8>,
    read_body_pos: usize,
    write_pending: Vec<u8>,
    write_pos: usize,
}

impl FramedUdpStream {
    pub fn new(inner: Stream) -> Self {
        Self {
            inner,
            read_head: [0u8; 2],
            read_head_pos: 0,
            read_body: Vec::new(),
            read_body_pos: 0,
            write_pending: Vec::new(),
            write_pos: 0,
        }
    }
}

impl AsyncRead for FramedUdpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            // head first, then the body, then hand over one datagram
            if this.read_head_pos < 2 {
                let mut rb = ReadBuf::new(&mut this.read_head[this.read_head_pos..]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                    Poll::Ready(Ok(())) => {
                        let n = rb.filled().len();
                        if n == 0 {
                            return Poll::Ready(Ok(()));
                        }
                        this.read_head_pos += n;
                        continue;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }

            if this.read_body.is_empty() {
                let len = u16::from_be_bytes(this.read_head) as usize;
                this.read_body = vec![0u8; len];
                this.read_body_pos = 0;
                if len == 0 {
                    this.read_head_pos = 0;
                    continue;
                }
            }

            while this.read_body_pos < this.read_body.len() {
                let mut rb = ReadBuf::new(&mut this.read_body[this.read_body_pos..]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                    Poll::Ready(Ok(())) => {
                        let n = rb.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        this.read_body_pos += n;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }

            let datagram = std::mem::take(&mut this.read_body);
            this.read_head_pos = 0;
            let n = datagram.len().min(buf.remaining());
            buf.put_slice(&datagram[..n]);
            return Poll::Ready(Ok(()));
        }
    }
}

impl AsyncWrite for FramedUdpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        while this.write_pos < this.write_pending.len() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.write_pending[this.write_pos..])
            {
                Poll::Ready(Ok(0)) => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                Poll::Ready(Ok(n)) => this.write_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        this.write_pending.clear();
        this.write_pos = 0;

        let len = buf.len().min(u16::MAX as usize);
        this.write_pending.extend_from_slice(&(len as u16).to_be_bytes());
        this.write_pending.extend_from_slice(&buf[..len]);
        Poll::Ready(Ok(len))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        while this.write_pos < this.write_pending.len() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.write_pending[this.write_pos..])
            {
                Poll::Ready(Ok(0)) => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                Poll::Ready(Ok(n)) => this.write_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        this.write_pending.clear();
        this.write_pos = 0;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut self.inner).poll_shutdown(cx),
            other => other,
        }
    }
}
