//! SOCKS-style address encoding, shared by the SOCKS connectors and
//! handlers and reused by the shadowsocks and relay codecs.

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt};

use passage_core::addr::{Address, Host};
use passage_core::error::{Error, Result};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Append `atyp | addr | port` to `buf`.
pub fn encode_addr(buf: &mut Vec<u8>, addr: &Address) -> Result<()> {
    match &addr.host {
        Host::Ip(IpAddr::V4(ip)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Host::Ip(IpAddr::V6(ip)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
        Host::Domain(name) => {
            if name.len() > 255 {
                return Err(Error::Protocol(format!("domain too long: {name:?}")));
            }
            buf.push(ATYP_DOMAIN);
            buf.push(name.len() as u8);
            buf.extend_from_slice(name.as_bytes());
        }
    }
    buf.extend_from_slice(&addr.port.to_be_bytes());
    Ok(())
}

/// Read `atyp | addr | port` from the stream.
pub async fn read_addr<S>(stream: &mut S) -> Result<Address>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let atyp = stream.read_u8().await?;
    read_addr_after_atyp(stream, atyp).await
}

/// Like [`read_addr`] when the address-type byte was already consumed.
pub async fn read_addr_after_atyp<S>(stream: &mut S, atyp: u8) -> Result<Address>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Host::Ip(IpAddr::from(octets))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Host::Ip(IpAddr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::Protocol("domain is not utf-8".into()))?;
            Host::Domain(name)
        }
        other => {
            return Err(Error::Protocol(format!("unknown address type {other:#x}")));
        }
    };
    let port = stream.read_u16().await?;
    Ok(Address::new(host, port))
}

/// Decode from a byte slice; returns the address and consumed length.
pub fn decode_addr(buf: &[u8]) -> Result<(Address, usize)> {
    let short = || Error::Protocol("truncated address".into());
    let atyp = *buf.first().ok_or_else(short)?;
    let (host, used) = match atyp {
        ATYP_IPV4 => {
            let octets: [u8; 4] = buf.get(1..5).ok_or_else(short)?.try_into().expect("len 4");
            (Host::Ip(IpAddr::from(octets)), 5)
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] =
                buf.get(1..17).ok_or_else(short)?.try_into().expect("len 16");
            (Host::Ip(IpAddr::from(octets)), 17)
        }
        ATYP_DOMAIN => {
            let len = *buf.get(1).ok_or_else(short)? as usize;
            let name = buf.get(2..2 + len).ok_or_else(short)?;
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| Error::Protocol("domain is not utf-8".into()))?;
            (Host::Domain(name), 2 + len)
        }
        other => {
            return Err(Error::Protocol(format!("unknown address type {other:#x}")));
        }
    };
    let port_bytes = buf.get(used..used + 2).ok_or_else(short)?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
    Ok((Address::new(host, port), used + 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(addr: &str) {
        let addr: Address = addr.parse().unwrap();
        let mut buf = Vec::new();
        encode_addr(&mut buf, &addr).unwrap();
        let (decoded, used) = decode_addr(&buf).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn encodes_all_address_kinds() {
        round_trip("1.2.3.4:80");
        round_trip("[2001:db8::2]:8443");
        round_trip("example.com:443");
    }

    #[tokio::test]
    async fn stream_decode_matches() {
        let addr: Address = "example.com:443".parse().unwrap();
        let mut buf = Vec::new();
        encode_addr(&mut buf, &addr).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_addr(&mut cursor).await.unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn unknown_atyp_is_a_protocol_error() {
        let err = decode_addr(&[0x07, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
