//! Plain TCP listener.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use passage_core::contract::{ConnMeta, Listener, Stream};
use passage_core::error::{Error, Result};
use passage_core::metadata::Metadata;

/// Accepts raw TCP connections.
///
/// Metadata: `redirect` recovers the pre-NAT destination
/// (SO_ORIGINAL_DST) for transparent-proxy services.
pub struct TcpStreamListener {
    inner: TokioTcpListener,
    local: SocketAddr,
    redirect: bool,
    token: CancellationToken,
}

impl TcpStreamListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with(addr, &Metadata::new()).await
    }

    pub async fn bind_with(addr: &str, md: &Metadata) -> Result<Self> {
        let inner = TokioTcpListener::bind(addr).await?;
        let local = inner.local_addr()?;
        Ok(Self {
            inner,
            local,
            redirect: md.get_bool("redirect"),
            token: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Listener for TcpStreamListener {
    async fn accept(&self) -> Result<(Stream, ConnMeta)> {
        tokio::select! {
            _ = self.token.cancelled() => Err(Error::Closed),
            accepted = self.inner.accept() => {
                let (stream, peer) = accepted?;
                let _ = stream.set_nodelay(true);
                let mut meta = ConnMeta::new(peer).with_local(self.local);
                if self.redirect {
                    match original_dst(&stream) {
                        Ok(dst) => meta = meta.with_original_dst(dst),
                        Err(e) => debug!(peer = %peer, error = %e, "no original destination"),
                    }
                }
                Ok((Box::new(stream) as Stream, meta))
            }
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }

    fn close(&self) {
        self.token.cancel();
    }
}

/// SO_ORIGINAL_DST as set by the kernel NAT engine (IPv4 only).
#[cfg(target_os = "linux")]
fn original_dst(stream: &TcpStream) -> Result<SocketAddr> {
    use std::net::{IpAddr, Ipv4Addr};
    use std::os::fd::AsRawFd;

    const SO_ORIGINAL_DST: libc::c_int = 80;

    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let ip = IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)));
    Ok(SocketAddr::new(ip, u16::from_be(addr.sin_port)))
}

#[cfg(not(target_os = "linux"))]
fn original_dst(_stream: &TcpStream) -> Result<SocketAddr> {
    Err(Error::Unsupported("SO_ORIGINAL_DST"))
}
