//! I/O primitives: bidirectional relay, prefix replay, buffer pooling,
//! packet-connection adapters.

pub mod packet;
pub mod pool;
pub mod prefixed;
pub mod relay;

pub use packet::{PacketConn, StreamPacketConn, relay_packets};
pub use pool::BufferPool;
pub use prefixed::PrefixedStream;
pub use relay::{RelayStats, relay_streams};
