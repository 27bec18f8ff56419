//! Wiring: configuration tree to running services.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use passage_chain::{Chain, Hop, Marker, Node, Router, Strategy};
use passage_core::bypass::HostBypass;
use passage_core::contract::{
    Auther, Bypass, ConnectorOptions, Credentials, DialerOptions, HostMapper, Resolver,
};
use passage_core::defaults::{DEFAULT_FAIL_TIMEOUT, DEFAULT_MAX_FAILS};
use passage_core::error::{Error, Result};
use passage_core::hosts::StaticHosts;
use passage_core::metadata::Metadata;
use passage_core::auth::MemoryAuther;
use passage_dns::DnsResolver;
use passage_handler::HandlerOptions;
use passage_service::Service;

use crate::registry::{self, ListenerOptions};
use crate::types::*;

/// Build every configured service. Registries must already hold the
/// builtins; this calls [`registry::register_builtins`] defensively.
pub async fn build_services(config: &Config) -> Result<Vec<Arc<Service>>> {
    registry::register_builtins();

    let bypasses = build_bypasses(config);
    let hosts = build_hosts(config)?;
    let resolvers = build_resolvers(config)?;
    let chains = build_chains(config, &bypasses)?;

    let mut services = Vec::with_capacity(config.services.len());
    for service_cfg in &config.services {
        let service = build_service(service_cfg, &chains, &bypasses, &hosts, &resolvers).await?;
        services.push(service);
    }
    Ok(services)
}

fn build_bypasses(config: &Config) -> HashMap<String, Arc<dyn Bypass>> {
    config
        .bypasses
        .iter()
        .map(|b| {
            let bypass: Arc<dyn Bypass> =
                Arc::new(HostBypass::new(b.matchers.iter(), b.whitelist));
            (b.name.clone(), bypass)
        })
        .collect()
}

fn build_hosts(config: &Config) -> Result<HashMap<String, Arc<dyn HostMapper>>> {
    let mut out = HashMap::new();
    for h in &config.hosts {
        let mut hosts = StaticHosts::new();
        for mapping in &h.mappings {
            let ip = mapping
                .ip
                .parse()
                .map_err(|_| Error::Protocol(format!("bad host mapping ip {:?}", mapping.ip)))?;
            hosts.insert(&mapping.hostname, ip);
        }
        out.insert(h.name.clone(), Arc::new(hosts) as Arc<dyn HostMapper>);
    }
    Ok(out)
}

fn build_resolvers(config: &Config) -> Result<HashMap<String, Arc<dyn Resolver>>> {
    let mut out = HashMap::new();
    for r in &config.resolvers {
        let resolver = DnsResolver::from_system(r.prefer_ipv4)?;
        out.insert(r.name.clone(), Arc::new(resolver) as Arc<dyn Resolver>);
    }
    Ok(out)
}

fn build_chains(
    config: &Config,
    bypasses: &HashMap<String, Arc<dyn Bypass>>,
) -> Result<HashMap<String, Arc<Chain>>> {
    let mut out = HashMap::new();
    for chain_cfg in &config.chains {
        let mut chain = Chain::new(&chain_cfg.name);
        for hop_cfg in &chain_cfg.hops {
            let selector = hop_cfg
                .selector
                .as_ref()
                .or(chain_cfg.selector.as_ref());
            let mut nodes = Vec::with_capacity(hop_cfg.nodes.len());
            for node_cfg in &hop_cfg.nodes {
                nodes.push(Arc::new(build_node(node_cfg, selector, bypasses)?));
            }
            let strategy = selector
                .map(|s| Strategy::parse(&s.strategy))
                .unwrap_or_default();
            chain = chain.add_hop(Hop::with_strategy(&hop_cfg.name, nodes, strategy));
        }
        debug!(chain = %chain_cfg.name, hops = chain.hops().len(), "chain built");
        out.insert(chain_cfg.name.clone(), Arc::new(chain));
    }
    Ok(out)
}

fn build_node(
    node_cfg: &NodeConfig,
    selector: Option<&SelectorConfig>,
    bypasses: &HashMap<String, Arc<dyn Bypass>>,
) -> Result<Node> {
    let dialer_kind = kind_or(&node_cfg.dialer.kind, "tcp");
    let dialer_factory = registry::DIALERS
        .get(dialer_kind)
        .ok_or_else(|| Error::Protocol(format!("unknown dialer {dialer_kind:?}")))?;
    let mut dialer_md = metadata_from(&node_cfg.dialer.metadata);
    if let Some(tls) = &node_cfg.dialer.tls {
        merge_tls(&mut dialer_md, tls);
    }
    let dialer = dialer_factory(&DialerOptions {
        auth: None,
        metadata: dialer_md,
    })?;

    let connector_kind = kind_or(&node_cfg.connector.kind, "http");
    let connector_factory = registry::CONNECTORS
        .get(connector_kind)
        .ok_or_else(|| Error::Protocol(format!("unknown connector {connector_kind:?}")))?;
    let connector = connector_factory(&ConnectorOptions {
        auth: node_cfg.connector.auth.as_ref().map(credentials_from),
        metadata: metadata_from(&node_cfg.connector.metadata),
    })?;

    let addr = node_cfg.addr.parse()?;
    let mut node = Node::new(&node_cfg.name, addr, dialer, connector).with_marker(marker_from(selector));
    if let Some(bypass_name) = &node_cfg.bypass {
        let bypass = bypasses
            .get(bypass_name)
            .ok_or_else(|| Error::Protocol(format!("unknown bypass {bypass_name:?}")))?;
        node = node.with_bypass(bypass.clone());
    }
    Ok(node)
}

async fn build_service(
    cfg: &ServiceConfig,
    chains: &HashMap<String, Arc<Chain>>,
    bypasses: &HashMap<String, Arc<dyn Bypass>>,
    hosts: &HashMap<String, Arc<dyn HostMapper>>,
    resolvers: &HashMap<String, Arc<dyn Resolver>>,
) -> Result<Arc<Service>> {
    let mut router = Router::new().with_retries(cfg.handler.retries);
    if let Some(chain_name) = &cfg.handler.chain {
        let chain = chains
            .get(chain_name)
            .ok_or_else(|| Error::Protocol(format!("unknown chain {chain_name:?}")))?;
        router = router.with_chain(chain.clone());
    }
    if let Some(name) = &cfg.handler.resolver {
        let resolver = resolvers
            .get(name)
            .ok_or_else(|| Error::Protocol(format!("unknown resolver {name:?}")))?;
        router = router.with_resolver(resolver.clone());
    }
    if let Some(name) = &cfg.handler.hosts {
        let mapper = hosts
            .get(name)
            .ok_or_else(|| Error::Protocol(format!("unknown hosts {name:?}")))?;
        router = router.with_hosts(mapper.clone());
    }
    let router = Arc::new(router);

    let handler_kind = kind_or(&cfg.handler.kind, "auto");
    let mut handler_md = metadata_from(&cfg.handler.metadata);
    seed_forward_metadata(handler_kind, cfg, &mut handler_md);

    let mut handler_opts = HandlerOptions::new(router).with_metadata(handler_md);
    if !cfg.handler.auths.is_empty() {
        let auther = MemoryAuther::from_credentials(
            cfg.handler.auths.iter().map(credentials_from),
        );
        handler_opts = handler_opts.with_auther(Arc::new(auther) as Arc<dyn Auther>);
    }
    if let Some(bypass_name) = &cfg.handler.bypass {
        let bypass = bypasses
            .get(bypass_name)
            .ok_or_else(|| Error::Protocol(format!("unknown bypass {bypass_name:?}")))?;
        handler_opts = handler_opts.with_bypass(bypass.clone());
    }
    let handler_factory = registry::HANDLERS
        .get(handler_kind)
        .ok_or_else(|| Error::Protocol(format!("unknown handler {handler_kind:?}")))?;
    let handler = handler_factory(&handler_opts)?;

    let listener_kind = kind_or(&cfg.listener.kind, "tcp");
    let listener_factory = registry::LISTENERS
        .get(listener_kind)
        .ok_or_else(|| Error::Protocol(format!("unknown listener {listener_kind:?}")))?;
    let mut listener_md = metadata_from(&cfg.listener.metadata);
    if let Some(tls) = &cfg.listener.tls {
        merge_tls(&mut listener_md, tls);
    }
    let listener_router = match &cfg.listener.chain {
        Some(chain_name) => {
            let chain = chains
                .get(chain_name)
                .ok_or_else(|| Error::Protocol(format!("unknown chain {chain_name:?}")))?;
            Some(Arc::new(Router::new().with_chain(chain.clone())))
        }
        None => None,
    };
    let listener = listener_factory(ListenerOptions {
        addr: normalize_addr(&cfg.addr),
        metadata: listener_md,
        router: listener_router,
    })
    .await?;

    Ok(Arc::new(Service::new(&cfg.name, listener, handler)))
}

/// Forward handlers receive their target set and network through
/// metadata.
fn seed_forward_metadata(kind: &str, cfg: &ServiceConfig, md: &mut Metadata) {
    if let Some(fwd) = &cfg.forwarder {
        md.set(
            "targets",
            Value::Array(
                fwd.targets
                    .iter()
                    .map(|t| Value::String(t.clone()))
                    .collect(),
            ),
        );
        if let Some(selector) = &fwd.selector {
            md.set("strategy", selector.strategy.clone());
        }
    }
    if matches!(kind, "udp" | "rudp" | "ssu") {
        md.set("network", "udp");
    }
}

fn kind_or<'a>(kind: &'a str, default: &'a str) -> &'a str {
    if kind.is_empty() { default } else { kind }
}

fn metadata_from(map: &HashMap<String, Value>) -> Metadata {
    map.iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn credentials_from(auth: &AuthConfig) -> Credentials {
    Credentials::new(&auth.username, &auth.password)
}

fn marker_from(selector: Option<&SelectorConfig>) -> Marker {
    let max_fails = selector
        .and_then(|s| s.max_fails)
        .unwrap_or(DEFAULT_MAX_FAILS);
    let fail_timeout = selector
        .and_then(|s| s.fail_timeout_secs)
        .map(std::time::Duration::from_secs)
        .unwrap_or(DEFAULT_FAIL_TIMEOUT);
    Marker::new(max_fails, fail_timeout)
}

/// `:8080` binds on every interface.
fn normalize_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        return format!("0.0.0.0:{port}");
    }
    addr.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_a_socks5_service_over_a_chain() {
        let config = Config {
            services: vec![ServiceConfig {
                name: "entry".into(),
                addr: "127.0.0.1:0".into(),
                handler: HandlerConfig {
                    kind: "socks5".into(),
                    chain: Some("out".into()),
                    retries: 1,
                    ..Default::default()
                },
                listener: ListenerConfig {
                    kind: "tcp".into(),
                    ..Default::default()
                },
                forwarder: None,
            }],
            chains: vec![ChainConfig {
                name: "out".into(),
                selector: None,
                hops: vec![HopConfig {
                    name: "hop0".into(),
                    selector: None,
                    nodes: vec![NodeConfig {
                        name: "n0".into(),
                        addr: "relay.example.com:1080".into(),
                        connector: ConnectorConfig {
                            kind: "socks5".into(),
                            ..Default::default()
                        },
                        dialer: DialerConfig {
                            kind: "tcp".into(),
                            ..Default::default()
                        },
                        bypass: None,
                    }],
                }],
            }],
            ..Default::default()
        };

        let services = build_services(&config).await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name(), "entry");
        services[0].close();
    }

    #[tokio::test]
    async fn unknown_plugin_names_fail_loudly() {
        let config = Config {
            services: vec![ServiceConfig {
                name: "bad".into(),
                addr: "127.0.0.1:0".into(),
                handler: HandlerConfig {
                    kind: "quantum".into(),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        };
        // unknown handler kinds never fall back silently in config files
        let err = build_services(&config).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn cli_urls_build_end_to_end() {
        let svc = crate::parse_service_url("socks5://127.0.0.1:0").unwrap();
        let hop = crate::parse_hop_url("http+tls://user:pw@relay.example.com:443").unwrap();
        let config = Config {
            services: vec![ServiceConfig {
                handler: HandlerConfig {
                    chain: Some("default".into()),
                    ..svc.handler
                },
                ..svc
            }],
            chains: vec![ChainConfig {
                name: "default".into(),
                selector: None,
                hops: vec![HopConfig {
                    name: "hop-0".into(),
                    selector: None,
                    nodes: vec![hop],
                }],
            }],
            ..Default::default()
        };
        let services = build_services(&config).await.unwrap();
        services[0].close();
    }
}
