//! Target address model.
//!
//! An [`Address`] is what handlers extract from client requests and what
//! travels down the chain: a host (IP literal or domain) plus a port.
//! Resolution to socket addresses happens at the router, never earlier.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::Error;

/// Transport network selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host part of a target address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ip(IpAddr),
    Domain(String),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ip(ip) => write!(f, "{ip}"),
            Host::Domain(d) => f.write_str(d),
        }
    }
}

/// A `host:port` target, unresolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: Host,
    pub port: u16,
}

impl Address {
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    /// Build from a domain name, without attempting an IP parse.
    pub fn domain(name: impl Into<String>, port: u16) -> Self {
        Self {
            host: Host::Domain(name.into()),
            port,
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self.host, Host::Domain(_))
    }

    /// The socket address, if the host is an IP literal.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self.host {
            Host::Ip(ip) => Some(SocketAddr::new(ip, self.port)),
            Host::Domain(_) => None,
        }
    }

    pub fn host_str(&self) -> String {
        self.host.to_string()
    }
}

impl From<SocketAddr> for Address {
    fn from(sa: SocketAddr) -> Self {
        Self {
            host: Host::Ip(sa.ip()),
            port: sa.port(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            host => write!(f, "{host}:{}", self.port),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Parse `host:port`, with bracket notation for IPv6 literals.
    fn from_str(s: &str) -> Result<Self, Error> {
        let (host, port) = split_host_port(s)
            .ok_or_else(|| Error::Protocol(format!("invalid address {s:?}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Protocol(format!("invalid port in {s:?}")))?;
        let host = match host.parse::<IpAddr>() {
            Ok(ip) => Host::Ip(ip),
            Err(_) => Host::Domain(host.to_string()),
        };
        Ok(Self { host, port })
    }
}

/// Split `host:port`, handling `[v6]:port` brackets.
fn split_host_port(s: &str) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        let port = rest.strip_prefix(':')?;
        return Some((host, port));
    }
    s.rsplit_once(':')
}
