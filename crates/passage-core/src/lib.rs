//! Core types and contracts shared across the passage workspace.
//!
//! This crate defines:
//! - The component contracts ([`Dialer`], [`Connector`], [`Listener`],
//!   [`Handler`]) and the side interfaces they consume
//! - The [`Metadata`] bag used to configure every plugin
//! - The generic name-to-factory [`registry::Registry`]
//! - The error model with its kind discriminators
//! - Relay, prefix-replay and buffer-pool I/O primitives

pub mod addr;
pub mod auth;
pub mod bypass;
pub mod contract;
pub mod defaults;
pub mod error;
pub mod hosts;
pub mod io;
pub mod metadata;
pub mod registry;

pub use addr::{Address, Host, Network};
pub use contract::{
    AsyncReadWrite, Auther, Bypass, ConnMeta, Connector, Dialer, Handler, HostMapper, Listener,
    Resolver, Stream,
};
pub use error::{Error, Result};
pub use metadata::Metadata;

/// Project name.
pub const PROJECT_NAME: &str = "passage";
/// Project version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
