//! SOCKS5 connector (RFC 1928, RFC 1929).

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::debug;

use passage_core::addr::{Address, Host, Network};
use passage_core::contract::{ConnMeta, Connector, ConnectorOptions, Credentials, Listener, Stream};
use passage_core::error::{Error, Result};

use crate::socks;

pub const VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_NOT_ALLOWED: u8 = 0x02;
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Client side of the SOCKS5 tunnel protocol.
///
/// `handshake` runs method negotiation (and RFC 1929 auth when
/// credentials are configured); `connect` issues CONNECT, or UDP
/// ASSOCIATE for UDP targets; `bind` issues BIND for reverse mode.
///
/// Metadata: `connectTimeout`.
pub struct Socks5Connector {
    auth: Option<Credentials>,
    connect_timeout: Duration,
}

impl Socks5Connector {
    pub fn new(opts: &ConnectorOptions) -> Self {
        Self {
            auth: opts.auth.clone(),
            connect_timeout: opts.metadata.get_duration("connectTimeout"),
        }
    }

    async fn negotiate(&self, mut stream: Stream) -> Result<Stream> {
        let methods: &[u8] = if self.auth.is_some() {
            &[METHOD_NO_AUTH, METHOD_USER_PASS]
        } else {
            &[METHOD_NO_AUTH]
        };
        let mut greeting = vec![VERSION, methods.len() as u8];
        greeting.extend_from_slice(methods);
        stream.write_all(&greeting).await?;
        stream.flush().await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != VERSION {
            return Err(Error::Protocol(format!("bad socks version {:#x}", reply[0])));
        }
        match reply[1] {
            METHOD_NO_AUTH => Ok(stream),
            METHOD_USER_PASS => {
                let Some(auth) = &self.auth else {
                    return Err(Error::Auth);
                };
                let mut msg = vec![0x01, auth.username.len() as u8];
                msg.extend_from_slice(auth.username.as_bytes());
                msg.push(auth.password.len() as u8);
                msg.extend_from_slice(auth.password.as_bytes());
                stream.write_all(&msg).await?;
                stream.flush().await?;

                let mut status = [0u8; 2];
                stream.read_exact(&mut status).await?;
                if status[1] != 0x00 {
                    return Err(Error::Auth);
                }
                Ok(stream)
            }
            METHOD_NO_ACCEPTABLE => Err(Error::Auth),
            other => Err(Error::Protocol(format!("unexpected method {other:#x}"))),
        }
    }

    async fn request(
        &self,
        stream: &mut Stream,
        cmd: u8,
        target: &Address,
    ) -> Result<Address> {
        let mut msg = vec![VERSION, cmd, 0x00];
        socks::encode_addr(&mut msg, target)?;
        stream.write_all(&msg).await?;
        stream.flush().await?;
        read_reply(stream).await
    }
}

/// Read a reply frame, mapping the reply code to an error kind.
pub async fn read_reply<S>(stream: &mut S) -> Result<Address>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(Error::Protocol(format!("bad socks version {:#x}", head[0])));
    }
    let bound = socks::read_addr(stream).await?;
    match head[1] {
        REPLY_SUCCEEDED => Ok(bound),
        REPLY_NOT_ALLOWED => Err(Error::Refused("ruleset refused".into())),
        REPLY_COMMAND_NOT_SUPPORTED => Err(Error::Unsupported("socks5 command")),
        code => Err(Error::Unavailable(format!("socks5 reply {code:#x}"))),
    }
}

#[async_trait]
impl Connector for Socks5Connector {
    async fn handshake(&self, stream: Stream) -> Result<Stream> {
        match self.connect_timeout {
            t if t.is_zero() => self.negotiate(stream).await,
            t => tokio::time::timeout(t, self.negotiate(stream))
                .await
                .map_err(|_| Error::timeout("socks5 negotiation"))?,
        }
    }

    async fn connect(
        &self,
        mut stream: Stream,
        network: Network,
        target: &Address,
    ) -> Result<Stream> {
        match network {
            Network::Tcp => {
                self.request(&mut stream, CMD_CONNECT, target).await?;
                debug!(target = %target, "socks5 connect established");
                Ok(stream)
            }
            Network::Udp => {
                let probe = Address::new(Host::Ip([0, 0, 0, 0].into()), 0);
                let relay = self.request(&mut stream, CMD_UDP_ASSOCIATE, &probe).await?;
                let Some(relay) = relay.to_socket_addr() else {
                    return Err(Error::Protocol(format!("bad relay address {relay}")));
                };
                let socket = UdpSocket::bind(match relay {
                    SocketAddr::V4(_) => "0.0.0.0:0",
                    SocketAddr::V6(_) => "[::]:0",
                })
                .await?;
                socket.connect(relay).await?;
                debug!(target = %target, relay = %relay, "socks5 udp associated");
                Ok(Box::new(Socks5UdpStream::new(stream, socket, target.clone())?))
            }
        }
    }

    async fn bind(
        &self,
        mut stream: Stream,
        network: Network,
        addr: &Address,
    ) -> Result<Box<dyn Listener>> {
        if network != Network::Tcp {
            return Err(Error::Unsupported("socks5 bind over udp"));
        }
        let bound = self.request(&mut stream, CMD_BIND, addr).await?;
        debug!(requested = %addr, bound = %bound, "socks5 bind pending");
        Ok(Box::new(Socks5BoundListener {
            pending: Mutex::new(Some(stream)),
            bound: bound
                .to_socket_addr()
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], bound.port))),
        }))
    }
}

/// One-shot listener backing SOCKS5 BIND: the second reply announces
/// the inbound peer, after which the control stream *is* the
/// connection.
struct Socks5BoundListener {
    pending: Mutex<Option<Stream>>,
    bound: SocketAddr,
}

#[async_trait]
impl Listener for Socks5BoundListener {
    async fn accept(&self) -> Result<(Stream, ConnMeta)> {
        let mut slot = self.pending.lock().await;
        let Some(mut stream) = slot.take() else {
            return Err(Error::Closed);
        };
        let peer = read_reply(&mut stream).await?;
        let peer = peer
            .to_socket_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], peer.port)));
        Ok((stream, ConnMeta::new(peer).with_local(self.bound)))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.bound)
    }

    fn close(&self) {
        if let Ok(mut slot) = self.pending.try_lock() {
            slot.take();
        }
    }
}

/// UDP ASSOCIATE datagram pipe. Writes prepend the RFC 1928 §7 header
/// toward the relay; reads strip it. The TCP control stream rides along
/// so dropping the pipe tears the association down.
pub struct Socks5UdpStream {
    _control: Stream,
    socket: UdpSocket,
    header: Vec<u8>,
}

impl Socks5UdpStream {
    fn new(control: Stream, socket: UdpSocket, target: Address) -> Result<Self> {
        let mut header = vec![0x00, 0x00, 0x00];
        socks::encode_addr(&mut header, &target)?;
        Ok(Self {
            _control: control,
            socket,
            header,
        })
    }
}

impl AsyncRead for Socks5UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut raw = [0u8; 65536];
        let mut raw_buf = ReadBuf::new(&mut raw);
        match self.socket.poll_recv(cx, &mut raw_buf) {
            Poll::Ready(Ok(())) => {
                let datagram = raw_buf.filled();
                // RSV(2) FRAG(1) ATYP ADDR PORT | payload
                if datagram.len() < 4 || datagram[2] != 0 {
                    // fragments are not supported; drop silently
                    return Poll::Ready(Ok(()));
                }
                let Ok((_, consumed)) = socks::decode_addr(&datagram[3..]) else {
                    return Poll::Ready(Ok(()));
                };
                let payload = &datagram[3 + consumed..];
                let n = payload.len().min(buf.remaining());
                buf.put_slice(&payload[..n]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Socks5UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut datagram = Vec::with_capacity(self.header.len() + buf.len());
        datagram.extend_from_slice(&self.header);
        datagram.extend_from_slice(buf);
        match self.socket.poll_send(cx, &datagram) {
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(buf.len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::ATYP_IPV4;
    use tokio::io::duplex;

    fn connector(auth: Option<Credentials>) -> Socks5Connector {
        Socks5Connector {
            auth,
            connect_timeout: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn negotiates_no_auth() {
        let (near, mut far) = duplex(256);
        let task = tokio::spawn(async move {
            let mut head = [0u8; 2];
            far.read_exact(&mut head).await.unwrap();
            assert_eq!(head, [VERSION, 1]);
            let mut methods = [0u8; 1];
            far.read_exact(&mut methods).await.unwrap();
            assert_eq!(methods, [METHOD_NO_AUTH]);
            far.write_all(&[VERSION, METHOD_NO_AUTH]).await.unwrap();
            far
        });
        connector(None).handshake(Box::new(near)).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn runs_user_pass_subnegotiation() {
        let (near, mut far) = duplex(256);
        let task = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            far.read_exact(&mut greeting).await.unwrap();
            assert_eq!(&greeting[2..], &[METHOD_NO_AUTH, METHOD_USER_PASS]);
            far.write_all(&[VERSION, METHOD_USER_PASS]).await.unwrap();

            // 0x01 ulen "bob" plen "pw"
            let mut auth = vec![0u8; 2 + 3 + 1 + 2];
            far.read_exact(&mut auth).await.unwrap();
            assert_eq!(auth, [0x01, 3, b'b', b'o', b'b', 2, b'p', b'w']);
            far.write_all(&[0x01, 0x00]).await.unwrap();
        });
        connector(Some(Credentials::new("bob", "pw")))
            .handshake(Box::new(near))
            .await
            .unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn second_handshake_on_same_stream_fails() {
        // after negotiation the server expects a request frame; a second
        // greeting reads the connect reply bytes as a method reply and
        // must not succeed
        let (near, mut far) = duplex(256);
        let task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            far.read_exact(&mut greeting).await.unwrap();
            far.write_all(&[VERSION, METHOD_NO_AUTH]).await.unwrap();
            // the server is now waiting for a request; echo nothing else
            let mut rest = [0u8; 3];
            far.read_exact(&mut rest).await.unwrap();
            // garbage answer a real server would never send for a greeting
            far.write_all(&[0x00, 0xFF]).await.unwrap();
        });
        let c = connector(None);
        let stream = c.handshake(Box::new(near)).await.unwrap();
        let err = c.handshake(stream).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn connect_sends_request_and_parses_reply() {
        let (near, mut far) = duplex(256);
        let target: Address = "1.2.3.4:22".parse().unwrap();
        let task = tokio::spawn(async move {
            let mut req = [0u8; 10];
            far.read_exact(&mut req).await.unwrap();
            assert_eq!(
                req,
                [VERSION, CMD_CONNECT, 0, ATYP_IPV4, 1, 2, 3, 4, 0, 22]
            );
            far.write_all(&[VERSION, REPLY_SUCCEEDED, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });
        connector(None)
            .connect(Box::new(near), Network::Tcp, &target)
            .await
            .unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn refused_reply_maps_to_refused() {
        let (near, mut far) = duplex(256);
        let target: Address = "1.2.3.4:22".parse().unwrap();
        let task = tokio::spawn(async move {
            let mut req = [0u8; 10];
            far.read_exact(&mut req).await.unwrap();
            far.write_all(&[VERSION, REPLY_NOT_ALLOWED, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });
        let err = connector(None)
            .connect(Box::new(near), Network::Tcp, &target)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Refused(_)));
        task.await.unwrap();
    }
}
