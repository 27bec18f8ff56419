//! Transport layer: dialers open raw connections to one hop, listeners
//! accept them. Both ends speak tcp, udp, tls, ws/wss and h2; the
//! WebSocket and HTTP/2 variants expose logical byte streams behind the
//! same [`passage_core::Stream`] shape the rest of the pipeline relays.

pub mod dialer;
pub mod listener;
pub mod queue;
pub mod stream;
pub mod tls;

pub use dialer::{H2Dialer, TcpDialer, TlsDialer, UdpDialer, WsDialer};
pub use listener::{
    H2Listener, TcpStreamListener, TlsListener, UdpSessionListener, WsListener,
};
