//! Service lifecycle: binds one listener to one handler and runs the
//! accept loop. Reverse listeners that bind through a chain live here
//! too.

pub mod reverse;
pub mod service;

pub use reverse::{ReverseTcpListener, ReverseUdpListener};
pub use service::Service;
