//! Async DNS resolver backed by hickory-resolver.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::Resolver as HickoryResolver;
use hickory_resolver::name_server::TokioConnectionProvider;
use tracing::debug;

use passage_core::contract::Resolver;
use passage_core::error::{Error, Result};

/// Shared async resolver implementing the pipeline's [`Resolver`]
/// contract.
///
/// Wraps `hickory_resolver` with its built-in TTL cache. IP literals
/// short-circuit without a query. Thread-safe and cheaply cloneable.
#[derive(Clone)]
pub struct DnsResolver {
    inner: Arc<Inner>,
}

struct Inner {
    resolver: HickoryResolver<TokioConnectionProvider>,
    prefer_ipv4: bool,
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver")
            .field("prefer_ipv4", &self.inner.prefer_ipv4)
            .finish()
    }
}

impl DnsResolver {
    /// Build from the system DNS configuration. Call once at startup and
    /// share via `Clone`.
    pub fn from_system(prefer_ipv4: bool) -> Result<Self> {
        let mut builder = HickoryResolver::builder_tokio()
            .map_err(|e| Error::Resolve(format!("system dns config: {e}")))?;
        builder.options_mut().preserve_intermediates = true;
        Ok(Self {
            inner: Arc::new(Inner {
                resolver: builder.build(),
                prefer_ipv4,
            }),
        })
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let response = self
            .inner
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| Error::Resolve(format!("{host}: {e}")))?;

        let mut ips: Vec<IpAddr> = response.iter().collect();
        if self.inner.prefer_ipv4 {
            ips.sort_by_key(|ip| !ip.is_ipv4());
        }
        debug!(host = %host, count = ips.len(), "dns resolved");
        Ok(ips)
    }
}
