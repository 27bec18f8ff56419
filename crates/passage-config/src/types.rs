//! Configuration type definitions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fully-resolved configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub bypasses: Vec<BypassConfig>,
    #[serde(default)]
    pub resolvers: Vec<ResolverConfig>,
    #[serde(default)]
    pub hosts: Vec<HostsConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub addr: String,
    pub handler: HandlerConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub forwarder: Option<ForwarderConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub auths: Vec<AuthConfig>,
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default)]
    pub bypass: Option<String>,
    #[serde(default)]
    pub resolver: Option<String>,
    #[serde(default)]
    pub hosts: Option<String>,
    #[serde(default)]
    pub retries: usize,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Registry key; empty means `tcp`.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub tls: Option<TlsFileConfig>,
    /// Reverse listeners bind through this chain.
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwarderConfig {
    pub targets: Vec<String>,
    #[serde(default)]
    pub selector: Option<SelectorConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    #[serde(default)]
    pub selector: Option<SelectorConfig>,
    #[serde(default)]
    pub hops: Vec<HopConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HopConfig {
    pub name: String,
    #[serde(default)]
    pub selector: Option<SelectorConfig>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub dialer: DialerConfig,
    #[serde(default)]
    pub bypass: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Registry key; empty means `http`.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialerConfig {
    /// Registry key; empty means `tcp`.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub tls: Option<TlsFileConfig>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// File-based TLS material, merged into plugin metadata by the builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsFileConfig {
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub secure: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub max_fails: Option<u32>,
    #[serde(default)]
    pub fail_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BypassConfig {
    pub name: String,
    #[serde(default)]
    pub whitelist: bool,
    #[serde(default)]
    pub matchers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub name: String,
    #[serde(default)]
    pub prefer_ipv4: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostsConfig {
    pub name: String,
    #[serde(default)]
    pub mappings: Vec<HostMappingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostMappingConfig {
    pub hostname: String,
    pub ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: Option<String>,
    /// `json`, `compact` or `pretty`.
    #[serde(default)]
    pub format: Option<String>,
    /// `stdout` or `stderr`.
    #[serde(default)]
    pub output: Option<String>,
    /// Per-module level overrides.
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: None,
            output: None,
            filters: HashMap::new(),
        }
    }
}
