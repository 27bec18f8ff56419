//! SOCKS4/4a ingress handler.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use passage_chain::Router;
use passage_connector::socks4::{
    CMD_CONNECT, REPLY_GRANTED, REPLY_IDENTD_MISMATCH, REPLY_REJECTED, VERSION,
};
use passage_core::addr::{Address, Host, Network};
use passage_core::contract::{Auther, Bypass, ConnMeta, Handler, Stream};
use passage_core::error::{Error, Result};
use passage_core::io::relay_streams;

use crate::{HandlerOptions, RelaySettings};

pub struct Socks4Handler {
    router: Arc<Router>,
    auther: Option<Arc<dyn Auther>>,
    bypass: Option<Arc<dyn Bypass>>,
    settings: RelaySettings,
}

impl Socks4Handler {
    pub fn new(opts: &HandlerOptions) -> Self {
        Self {
            router: opts.router.clone(),
            auther: opts.auther.clone(),
            bypass: opts.bypass.clone(),
            settings: RelaySettings::from_metadata(&opts.metadata),
        }
    }

    async fn read_request(&self, stream: &mut Stream) -> Result<(u8, Address, String)> {
        let mut head = [0u8; 8];
        stream.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(Error::Protocol(format!("bad socks version {:#x}", head[0])));
        }
        let cmd = head[1];
        let port = u16::from_be_bytes([head[2], head[3]]);
        let ip = Ipv4Addr::new(head[4], head[5], head[6], head[7]);

        let userid = read_cstring(stream).await?;

        // 0.0.0.x (x != 0) marks the 4a domain extension
        let target = if ip.octets()[..3] == [0, 0, 0] && ip.octets()[3] != 0 {
            let domain = read_cstring(stream).await?;
            Address::new(Host::Domain(domain), port)
        } else {
            Address::new(Host::Ip(IpAddr::V4(ip)), port)
        };
        Ok((cmd, target, userid))
    }

    async fn serve(&self, mut stream: Stream, meta: ConnMeta) -> Result<()> {
        let (cmd, target, userid) =
            tokio::time::timeout(self.settings.read_timeout, self.read_request(&mut stream))
                .await
                .map_err(|_| Error::timeout("socks4 request read"))??;
        info!(peer = %meta.peer, target = %target, cmd, "socks4 request");

        if cmd != CMD_CONNECT {
            reply(&mut stream, REPLY_REJECTED).await?;
            return Err(Error::Unsupported("socks4 command"));
        }

        // the ident string doubles as a userid credential
        if let Some(auther) = &self.auther {
            if !auther.authenticate(&userid, "").await {
                info!(peer = %meta.peer, userid = %userid, "ident rejected");
                reply(&mut stream, REPLY_IDENTD_MISMATCH).await?;
                return Err(Error::Auth);
            }
        }

        if let Some(bypass) = &self.bypass {
            if bypass.contains(&target) {
                info!(peer = %meta.peer, target = %target, "bypass refused");
                reply(&mut stream, REPLY_REJECTED).await?;
                return Ok(());
            }
        }

        let upstream = match self.router.dial(Network::Tcp, &target).await {
            Ok(s) => s,
            Err(e) => {
                warn!(peer = %meta.peer, target = %target, error = %e, "dial failed");
                reply(&mut stream, REPLY_REJECTED).await?;
                return Err(e);
            }
        };
        reply(&mut stream, REPLY_GRANTED).await?;

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

async fn read_cstring(stream: &mut Stream) -> Result<String> {
    let mut out = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            return String::from_utf8(out)
                .map_err(|_| Error::Protocol("socks4 string is not utf-8".into()));
        }
        if out.len() >= 255 {
            return Err(Error::Protocol("socks4 string too long".into()));
        }
        out.push(byte);
    }
}

async fn reply(stream: &mut Stream, code: u8) -> Result<()> {
    let zero = SocketAddr::from(([0, 0, 0, 0], 0));
    let mut msg = vec![0x00, code];
    msg.extend_from_slice(&zero.port().to_be_bytes());
    msg.extend_from_slice(&[0, 0, 0, 0]);
    stream.write_all(&msg).await?;
    stream.flush().await?;
    Ok(())
}

#[async_trait]
impl Handler for Socks4Handler {
    async fn handle(&self, stream: Stream, meta: ConnMeta) -> Result<()> {
        self.serve(stream, meta).await
    }
}
