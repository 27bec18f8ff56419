//! Configuration: the typed tree consumed by the builder, file
//! loading, CLI URL ingestion, and the plugin registries.

pub mod builder;
pub mod loader;
pub mod registry;
pub mod types;
pub mod url;

pub use builder::build_services;
pub use loader::{ConfigError, load_config};
pub use registry::register_builtins;
pub use types::*;
pub use url::{parse_hop_url, parse_service_url};
