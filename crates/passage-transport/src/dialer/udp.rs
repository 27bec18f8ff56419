//! Connected UDP dialer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use passage_core::addr::Address;
use passage_core::contract::{Dialer, DialerOptions, Stream};
use passage_core::error::{Error, Result};

use crate::stream::UdpStream;

/// Binds an ephemeral socket and connects it to the target; the
/// resulting stream moves one datagram per read/write.
#[derive(Default)]
pub struct UdpDialer;

impl UdpDialer {
    pub fn new(_opts: &DialerOptions) -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for UdpDialer {
    async fn dial(&self, addr: &Address) -> Result<Stream> {
        let bind_addr = match addr.to_socket_addr() {
            Some(sa) if sa.is_ipv6() => "[::]:0",
            _ => "0.0.0.0:0",
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket
            .connect(addr.to_string())
            .await
            .map_err(|e| Error::Unavailable(format!("udp connect {addr}: {e}")))?;
        Ok(Box::new(UdpStream::new(Arc::new(socket))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn datagrams_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr: Address = server.local_addr().unwrap().into();

        let mut stream = UdpDialer.dial(&addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        server.send_to(b"pong", peer).await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }
}
