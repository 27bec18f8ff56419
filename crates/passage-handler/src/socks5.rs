//! SOCKS5 ingress handler (RFC 1928, RFC 1929): CONNECT and UDP
//! ASSOCIATE.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use passage_chain::Router;
use passage_connector::socks;
use passage_connector::socks5::{
    CMD_BIND, CMD_CONNECT, CMD_UDP_ASSOCIATE, METHOD_NO_ACCEPTABLE, METHOD_NO_AUTH,
    METHOD_USER_PASS, REPLY_COMMAND_NOT_SUPPORTED, REPLY_CONNECTION_REFUSED,
    REPLY_GENERAL_FAILURE, REPLY_HOST_UNREACHABLE, REPLY_NOT_ALLOWED, REPLY_SUCCEEDED, VERSION,
};
use passage_core::addr::{Address, Network};
use passage_core::contract::{Auther, Bypass, ConnMeta, Handler, Stream};
use passage_core::error::{Error, Result};
use passage_core::io::{pool, relay_streams};

use crate::{HandlerOptions, RelaySettings};

pub struct Socks5Handler {
    router: Arc<Router>,
    auther: Option<Arc<dyn Auther>>,
    bypass: Option<Arc<dyn Bypass>>,
    settings: RelaySettings,
}

impl Socks5Handler {
    pub fn new(opts: &HandlerOptions) -> Self {
        Self {
            router: opts.router.clone(),
            auther: opts.auther.clone(),
            bypass: opts.bypass.clone(),
            settings: RelaySettings::from_metadata(&opts.metadata),
        }
    }

    /// Method negotiation plus RFC 1929 when an auther is configured.
    async fn negotiate(&self, stream: &mut Stream) -> Result<()> {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(Error::Protocol(format!("bad socks version {:#x}", head[0])));
        }
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await?;

        match &self.auther {
            Some(auther) => {
                if !methods.contains(&METHOD_USER_PASS) {
                    stream.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await?;
                    stream.flush().await?;
                    return Err(Error::Auth);
                }
                stream.write_all(&[VERSION, METHOD_USER_PASS]).await?;
                stream.flush().await?;

                let mut sub = [0u8; 2];
                stream.read_exact(&mut sub).await?;
                if sub[0] != 0x01 {
                    return Err(Error::Protocol("bad auth subnegotiation".into()));
                }
                let mut user = vec![0u8; sub[1] as usize];
                stream.read_exact(&mut user).await?;
                let plen = stream.read_u8().await?;
                let mut pass = vec![0u8; plen as usize];
                stream.read_exact(&mut pass).await?;

                let user = String::from_utf8_lossy(&user).into_owned();
                let pass = String::from_utf8_lossy(&pass).into_owned();
                if !auther.authenticate(&user, &pass).await {
                    stream.write_all(&[0x01, 0x01]).await?;
                    stream.flush().await?;
                    return Err(Error::Auth);
                }
                stream.write_all(&[0x01, 0x00]).await?;
                stream.flush().await?;
                Ok(())
            }
            None => {
                if !methods.contains(&METHOD_NO_AUTH) {
                    stream.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await?;
                    stream.flush().await?;
                    return Err(Error::Auth);
                }
                stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
                stream.flush().await?;
                Ok(())
            }
        }
    }

    async fn serve(&self, mut stream: Stream, meta: ConnMeta) -> Result<()> {
        tokio::time::timeout(self.settings.read_timeout, self.negotiate(&mut stream))
            .await
            .map_err(|_| Error::timeout("socks5 negotiation"))??;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(Error::Protocol(format!("bad socks version {:#x}", head[0])));
        }
        let cmd = head[1];
        let target = socks::read_addr_after_atyp(&mut stream, head[3]).await?;
        info!(peer = %meta.peer, target = %target, cmd, "socks5 request");

        if let Some(bypass) = &self.bypass {
            if bypass.contains(&target) {
                info!(peer = %meta.peer, target = %target, "bypass refused");
                reply(&mut stream, REPLY_NOT_ALLOWED, None).await?;
                return Ok(());
            }
        }

        match cmd {
            CMD_CONNECT => self.serve_connect(stream, meta, target).await,
            CMD_BIND => self.serve_bind(stream, meta, target).await,
            CMD_UDP_ASSOCIATE => self.serve_udp_associate(stream, meta).await,
            _ => {
                reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED, None).await?;
                Err(Error::Unsupported("socks5 command"))
            }
        }
    }

    /// BIND: open a local listener, announce it, and once one inbound
    /// connection arrives, announce the peer and relay it over the
    /// control stream.
    async fn serve_bind(
        &self,
        mut control: Stream,
        meta: ConnMeta,
        requested: Address,
    ) -> Result<()> {
        let bind_addr = match requested.to_socket_addr() {
            Some(sa) => sa.to_string(),
            None => "0.0.0.0:0".to_string(),
        };
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(ln) => ln,
            Err(e) => {
                warn!(peer = %meta.peer, addr = %bind_addr, error = %e, "bind failed");
                reply(&mut control, REPLY_GENERAL_FAILURE, None).await?;
                return Err(e.into());
            }
        };
        let bound = listener.local_addr()?;
        reply(&mut control, REPLY_SUCCEEDED, Some(bound)).await?;
        debug!(peer = %meta.peer, bound = %bound, "socks5 bind listening");

        let (inbound, inbound_peer) = listener.accept().await?;
        let _ = inbound.set_nodelay(true);
        // a second inbound connection belongs to a fresh BIND exchange
        drop(listener);
        reply(&mut control, REPLY_SUCCEEDED, Some(inbound_peer)).await?;

        let stats = relay_streams(
            control,
            inbound,
            self.settings.buffer_size,
            self.settings.idle_timeout,
        )
        .await?;
        debug!(peer = %meta.peer, from = %inbound_peer, bytes = stats.total(), "bind relay finished");
        Ok(())
    }

    async fn serve_connect(
        &self,
        mut stream: Stream,
        meta: ConnMeta,
        target: Address,
    ) -> Result<()> {
        let upstream = match self.router.dial(Network::Tcp, &target).await {
            Ok(s) => s,
            Err(e) => {
                warn!(peer = %meta.peer, target = %target, error = %e, "dial failed");
                reply(&mut stream, reply_code_for(&e), None).await?;
                return Err(e);
            }
        };
        reply(&mut stream, REPLY_SUCCEEDED, meta.local).await?;

        let stats = relay_streams(
            stream,
            upstream,
            self.settings.buffer_size,
            self.settings.idle_timeout,
        )
        .await?;
        debug!(peer = %meta.peer, target = %target, up = stats.a_to_b, down = stats.b_to_a, "relay finished");
        Ok(())
    }

    /// Single-association UDP relay: the first client datagram fixes the
    /// target, later datagrams for other targets are dropped (chained
    /// UDP is point-to-point). The TCP control connection scopes the
    /// association's lifetime.
    async fn serve_udp_associate(&self, mut control: Stream, meta: ConnMeta) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let relay_port = socket.local_addr()?.port();
        let relay_ip = meta
            .local
            .map(|l| l.ip())
            .unwrap_or_else(|| std::net::IpAddr::from([0, 0, 0, 0]));
        reply(
            &mut control,
            REPLY_SUCCEEDED,
            Some(SocketAddr::new(relay_ip, relay_port)),
        )
        .await?;
        debug!(peer = %meta.peer, port = relay_port, "udp associate open");

        let mut ctl_buf = [0u8; 1];
        let mut dgram = pool::get(65536);

        // wait for the first datagram to learn the client and target
        let (client, target, first_payload) = loop {
            tokio::select! {
                n = control.read(&mut ctl_buf) => {
                    match n {
                        Ok(0) | Err(_) => return Ok(()),
                        Ok(_) => continue,
                    }
                }
                received = socket.recv_from(&mut dgram) => {
                    let (n, from) = received?;
                    if let Some((target, payload)) = strip_udp_header(&dgram[..n]) {
                        break (from, target, payload.to_vec());
                    }
                }
            }
        };

        let upstream = self.router.dial(Network::Udp, &target).await?;
        let (mut up_r, mut up_w) = tokio::io::split(upstream);
        up_w.write_all(&first_payload).await?;
        up_w.flush().await?;

        let mut encap = vec![0x00, 0x00, 0x00];
        socks::encode_addr(&mut encap, &target)?;
        let mut up_buf = pool::get(65536);

        loop {
            tokio::select! {
                n = control.read(&mut ctl_buf) => {
                    match n {
                        Ok(0) | Err(_) => {
                            debug!(peer = %meta.peer, "udp associate closed");
                            return Ok(());
                        }
                        Ok(_) => {}
                    }
                }
                received = socket.recv_from(&mut dgram) => {
                    let (n, from) = received?;
                    if from != client {
                        continue;
                    }
                    let Some((dst, payload)) = strip_udp_header(&dgram[..n]) else {
                        continue;
                    };
                    if dst != target {
                        debug!(requested = %dst, fixed = %target, "dropping datagram for second target");
                        continue;
                    }
                    up_w.write_all(payload).await?;
                    up_w.flush().await?;
                }
                n = up_r.read(&mut up_buf) => {
                    let n = n?;
                    if n == 0 {
                        return Ok(());
                    }
                    let mut packet = encap.clone();
                    packet.extend_from_slice(&up_buf[..n]);
                    socket.send_to(&packet, client).await?;
                }
            }
        }
    }
}

/// Parse the RFC 1928 §7 request header; `None` on fragments or
/// malformed datagrams.
fn strip_udp_header(datagram: &[u8]) -> Option<(Address, &[u8])> {
    if datagram.len() < 4 || datagram[2] != 0x00 {
        return None;
    }
    let (target, consumed) = socks::decode_addr(&datagram[3..]).ok()?;
    Some((target, &datagram[3 + consumed..]))
}

async fn reply(stream: &mut Stream, code: u8, bound: Option<SocketAddr>) -> Result<()> {
    let bound = bound.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    let mut msg = vec![VERSION, code, 0x00];
    socks::encode_addr(&mut msg, &bound.into())?;
    stream.write_all(&msg).await?;
    stream.flush().await?;
    Ok(())
}

fn reply_code_for(err: &Error) -> u8 {
    match err {
        Error::Refused(_) => REPLY_NOT_ALLOWED,
        Error::Resolve(_) => REPLY_HOST_UNREACHABLE,
        Error::Unavailable(_) | Error::Io(_) => REPLY_CONNECTION_REFUSED,
        _ => REPLY_GENERAL_FAILURE,
    }
}

#[async_trait]
impl Handler for Socks5Handler {
    async fn handle(&self, stream: Stream, meta: ConnMeta) -> Result<()> {
        self.serve(stream, meta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passage_core::auth::MemoryAuther;
    use passage_core::bypass::HostBypass;
    use passage_core::contract::Credentials;
    use tokio::io::duplex;

    fn handler(auther: Option<MemoryAuther>, bypass: Option<HostBypass>) -> Socks5Handler {
        let mut opts = HandlerOptions::new(Arc::new(Router::new()));
        if let Some(a) = auther {
            opts = opts.with_auther(Arc::new(a));
        }
        if let Some(b) = bypass {
            opts = opts.with_bypass(Arc::new(b));
        }
        Socks5Handler::new(&opts)
    }

    fn meta() -> ConnMeta {
        ConnMeta::new("127.0.0.1:5555".parse().unwrap())
    }

    #[tokio::test]
    async fn connect_round_trip_to_a_local_target() {
        // target echo server
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            s.write_all(b"world").await.unwrap();
        });

        let (mut client, server_side) = duplex(4096);
        let h = handler(None, None);
        let served = tokio::spawn(async move { h.serve(Box::new(server_side), meta()).await });

        // greeting
        client.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [VERSION, METHOD_NO_AUTH]);

        // request
        let mut req = vec![VERSION, CMD_CONNECT, 0x00];
        socks::encode_addr(&mut req, &target_addr.into()).unwrap();
        client.write_all(&req).await.unwrap();

        let mut reply_head = [0u8; 3];
        client.read_exact(&mut reply_head).await.unwrap();
        assert_eq!(reply_head[1], REPLY_SUCCEEDED);
        socks::read_addr(&mut client).await.unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client);
        served.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wrong_password_gets_auth_failure_reply() {
        let auther = MemoryAuther::from_credentials([Credentials::new("alice", "right")]);
        let h = handler(Some(auther), None);

        let (mut client, server_side) = duplex(4096);
        let served = tokio::spawn(async move { h.serve(Box::new(server_side), meta()).await });

        client
            .write_all(&[VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS])
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [VERSION, METHOD_USER_PASS]);

        client
            .write_all(&[0x01, 5, b'a', b'l', b'i', b'c', b'e', 5, b'w', b'r', b'o', b'n', b'g'])
            .await
            .unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x01, 0x01], "auth failure status");

        let err = served.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Auth));
    }

    #[tokio::test]
    async fn bypassed_target_is_refused_before_any_dial() {
        let bypass = HostBypass::new(["*.blocked.example.com"], false);
        let h = handler(None, Some(bypass));

        let (mut client, server_side) = duplex(4096);
        let served = tokio::spawn(async move { h.serve(Box::new(server_side), meta()).await });

        client.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();

        let mut req = vec![VERSION, CMD_CONNECT, 0x00];
        socks::encode_addr(&mut req, &"x.blocked.example.com:443".parse().unwrap()).unwrap();
        client.write_all(&req).await.unwrap();

        let mut reply_head = [0u8; 3];
        client.read_exact(&mut reply_head).await.unwrap();
        assert_eq!(reply_head[1], REPLY_NOT_ALLOWED);

        served.await.unwrap().unwrap();
    }
}
