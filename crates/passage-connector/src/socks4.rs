//! SOCKS4 / SOCKS4a connector.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use passage_core::addr::{Address, Host, Network};
use passage_core::contract::{Connector, ConnectorOptions, Credentials, Stream};
use passage_core::error::{Error, Result};

pub const VERSION: u8 = 0x04;
pub const CMD_CONNECT: u8 = 0x01;

pub const REPLY_GRANTED: u8 = 0x5A;
pub const REPLY_REJECTED: u8 = 0x5B;
pub const REPLY_NO_IDENTD: u8 = 0x5C;
pub const REPLY_IDENTD_MISMATCH: u8 = 0x5D;

/// SOCKS4 CONNECT. The 4a variant passes domain targets through for
/// remote resolution; plain SOCKS4 requires an IPv4 target.
///
/// Metadata: `connectTimeout`.
pub struct Socks4Connector {
    auth: Option<Credentials>,
    remote_resolve: bool,
    connect_timeout: Duration,
}

impl Socks4Connector {
    pub fn new(opts: &ConnectorOptions) -> Self {
        Self::build(opts, false)
    }

    /// SOCKS4a: domains resolved by the hop.
    pub fn new_4a(opts: &ConnectorOptions) -> Self {
        Self::build(opts, true)
    }

    fn build(opts: &ConnectorOptions, remote_resolve: bool) -> Self {
        Self {
            auth: opts.auth.clone(),
            remote_resolve,
            connect_timeout: opts.metadata.get_duration("connectTimeout"),
        }
    }

    async fn exchange(&self, mut stream: Stream, target: &Address) -> Result<Stream> {
        let mut req = vec![VERSION, CMD_CONNECT];
        req.extend_from_slice(&target.port.to_be_bytes());

        let domain = match &target.host {
            Host::Ip(IpAddr::V4(ip)) => {
                req.extend_from_slice(&ip.octets());
                None
            }
            Host::Ip(IpAddr::V6(_)) => {
                return Err(Error::Protocol("socks4 cannot carry an IPv6 target".into()));
            }
            Host::Domain(name) if self.remote_resolve => {
                // 0.0.0.x marks the 4a domain extension
                req.extend_from_slice(&[0, 0, 0, 1]);
                Some(name.clone())
            }
            Host::Domain(name) => {
                return Err(Error::Protocol(format!(
                    "socks4 requires an IP target, got {name:?}"
                )));
            }
        };

        if let Some(auth) = &self.auth {
            req.extend_from_slice(auth.username.as_bytes());
        }
        req.push(0x00);
        if let Some(domain) = domain {
            req.extend_from_slice(domain.as_bytes());
            req.push(0x00);
        }
        stream.write_all(&req).await?;
        stream.flush().await?;

        let mut reply = [0u8; 8];
        stream.read_exact(&mut reply).await?;
        if reply[0] != 0x00 {
            return Err(Error::Protocol(format!("bad reply version {:#x}", reply[0])));
        }
        match reply[1] {
            REPLY_GRANTED => {
                debug!(target = %target, "socks4 connect granted");
                Ok(stream)
            }
            REPLY_REJECTED => Err(Error::Refused(format!("socks4 rejected {target}"))),
            REPLY_NO_IDENTD | REPLY_IDENTD_MISMATCH => Err(Error::Auth),
            code => Err(Error::Unavailable(format!("socks4 reply {code:#x}"))),
        }
    }
}

#[async_trait]
impl Connector for Socks4Connector {
    async fn connect(&self, stream: Stream, network: Network, target: &Address) -> Result<Stream> {
        if network == Network::Udp {
            return Err(Error::Unsupported("udp over socks4"));
        }
        if self.connect_timeout.is_zero() {
            return self.exchange(stream, target).await;
        }
        tokio::time::timeout(self.connect_timeout, self.exchange(stream, target))
            .await
            .map_err(|_| Error::timeout("socks4 connect"))?
    }
}
