//! Transport dialers.

mod h2d;
mod tcp;
mod tlsd;
mod udp;
mod ws;

pub use h2d::H2Dialer;
pub use tcp::TcpDialer;
pub use tlsd::TlsDialer;
pub use udp::UdpDialer;
pub use ws::WsDialer;
