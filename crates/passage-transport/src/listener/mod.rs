//! Transport listeners.

mod h2l;
mod tcp;
mod tlsl;
mod udp;
mod wsl;

pub use h2l::H2Listener;
pub use tcp::TcpStreamListener;
pub use tlsl::TlsListener;
pub use udp::UdpSessionListener;
pub use wsl::WsListener;
