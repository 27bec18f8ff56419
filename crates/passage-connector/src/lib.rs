//! Tunneling connectors.
//!
//! A connector runs its protocol's handshake over an already-open hop
//! connection and asks the hop to open a logical connection to a
//! further target. The wire codecs shared with the handler side (SOCKS
//! address encoding, the shadowsocks AEAD stream, ClientHello parsing)
//! live here too.

pub mod clienthello;
pub mod forward;
pub mod http;
pub mod relay;
pub mod sni;
pub mod socks;
pub mod socks4;
pub mod socks5;
pub mod ss;

pub use forward::ForwardConnector;
pub use http::HttpConnector;
pub use relay::RelayConnector;
pub use sni::SniConnector;
pub use socks4::Socks4Connector;
pub use socks5::Socks5Connector;
pub use ss::SsConnector;
