//! Retrying, resolving wrapper around routes.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::{debug, warn};

use passage_core::addr::{Address, Host, Network};
use passage_core::contract::{HostMapper, Listener, Resolver, Stream};
use passage_core::error::{Error, Result};
use passage_core::io::packet::{PacketConn, StreamPacketConn};

use crate::chain::Chain;
use crate::route::Route;

/// Entry point handlers use to reach a target.
///
/// Wraps the chain with retries (a *fresh* route per attempt, so
/// selectors may pick different nodes), host-mapper-then-resolver name
/// resolution, and the UDP packet adapter.
pub struct Router {
    chain: Option<Arc<Chain>>,
    resolver: Option<Arc<dyn Resolver>>,
    hosts: Option<Arc<dyn HostMapper>>,
    retries: usize,
}

impl Router {
    pub fn new() -> Self {
        Self {
            chain: None,
            resolver: None,
            hosts: None,
            retries: 0,
        }
    }

    pub fn with_chain(mut self, chain: Arc<Chain>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_hosts(mut self, hosts: Arc<dyn HostMapper>) -> Self {
        self.hosts = Some(hosts);
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Whether dials traverse a configured chain or go out directly.
    pub fn has_chain(&self) -> bool {
        self.chain.as_ref().is_some_and(|c| !c.is_empty())
    }

    fn route_for(&self, network: Network, target: &Address) -> Route {
        match &self.chain {
            Some(chain) => chain.get_route(network, target),
            None => Route::direct(),
        }
    }

    /// Open a connection to `target`, retrying up to `retries + 1`
    /// attempts. Resolution failure is terminal; transport failures get
    /// a fresh route.
    pub async fn dial(&self, network: Network, target: &Address) -> Result<Stream> {
        debug!(network = %network, target = %target, "router dial");
        let mut last_err = None;

        for attempt in 0..=self.retries {
            let route = self.route_for(network, target);
            if !route.is_empty() {
                debug!(attempt, route = %route.describe(), target = %target, "route");
            }

            let target = match self.resolve(target).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(target = %target, error = %e, "resolution failed");
                    return Err(e);
                }
            };

            match route.dial(network, &target).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!(attempt, target = %target, error = %e, "route dial failed");
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Unavailable("no route".into())))
    }

    /// Like [`Router::dial`] for UDP, adapted to the packet shape. When
    /// the chain yields a plain byte stream the adapter degrades
    /// `recv`/`send` to reads and writes against the fixed remote.
    pub async fn dial_packet(&self, target: &Address) -> Result<Arc<dyn PacketConn>> {
        let stream = self.dial(Network::Udp, target).await?;
        let remote = target
            .to_socket_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], target.port)));
        Ok(Arc::new(StreamPacketConn::new(stream, remote)))
    }

    /// Open a listener on `addr`, through the chain when one is
    /// configured.
    pub async fn bind(&self, network: Network, addr: &Address) -> Result<Box<dyn Listener>> {
        debug!(network = %network, addr = %addr, "router bind");
        let mut last_err = None;

        for attempt in 0..=self.retries {
            let route = self.route_for(network, addr);
            match route.bind(network, addr).await {
                Ok(ln) => return Ok(ln),
                Err(e) => {
                    warn!(attempt, addr = %addr, error = %e, "route bind failed");
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Unavailable("no route".into())))
    }

    /// Map a domain target to an IP using the static hosts first, the
    /// resolver second. IP targets and resolver-less setups pass
    /// through. An empty resolver answer is a terminal `Resolve` error.
    async fn resolve(&self, target: &Address) -> Result<Address> {
        let Host::Domain(name) = &target.host else {
            return Ok(target.clone());
        };

        if let Some(ip) = self.hosts.as_ref().and_then(|h| h.lookup(name)) {
            debug!(host = %name, ip = %ip, "host mapper hit");
            return Ok(Address::new(Host::Ip(ip), target.port));
        }

        let Some(resolver) = &self.resolver else {
            return Ok(target.clone());
        };

        let ips: Vec<IpAddr> = resolver.resolve(name).await?;
        match ips.first() {
            Some(ip) => Ok(Address::new(Host::Ip(*ip), target.port)),
            None => Err(Error::Resolve(format!("{name}: no addresses"))),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Hop;
    use crate::selector::Strategy;
    use crate::test_support::{StubConnector, StubDialer, node_with};
    use async_trait::async_trait;

    fn target(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn failing_chain() -> (Arc<Chain>, Arc<StubDialer>) {
        let dialer = Arc::new(StubDialer::failing());
        let node = Arc::new(node_with(
            "always-down",
            dialer.clone(),
            Arc::new(StubConnector::default()),
        ));
        let chain =
            Chain::new("failing").add_hop(Hop::with_strategy("hop0", vec![node], Strategy::Fifo));
        (Arc::new(chain), dialer)
    }

    #[tokio::test]
    async fn retry_exhaustion_attempts_exactly_retries_plus_one() {
        let (chain, dialer) = failing_chain();
        let router = Router::new().with_chain(chain).with_retries(2);

        let err = router
            .dial(Network::Tcp, &target("example.com:80"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(dialer.calls(), 3, "retries=2 means 3 attempts");
    }

    #[tokio::test]
    async fn second_attempt_reaches_the_live_node() {
        // Two nodes behind round-robin: the first dial lands on the dead
        // one (clean marker), gets marked, and the retry picks the
        // survivor.
        let dead = Arc::new(StubDialer::failing());
        let live = Arc::new(StubDialer::ok());
        let n1 = Arc::new(node_with("n1", dead.clone(), Arc::new(StubConnector::default())));
        let n2 = Arc::new(node_with("n2", live.clone(), Arc::new(StubConnector::default())));
        let chain = Arc::new(
            Chain::new("half-dead")
                .add_hop(Hop::with_strategy("hop0", vec![n1.clone(), n2], Strategy::RoundRobin)),
        );
        let router = Router::new().with_chain(chain).with_retries(2);

        router
            .dial(Network::Tcp, &target("1.2.3.4:22"))
            .await
            .unwrap();
        assert_eq!(dead.calls(), 1);
        assert_eq!(live.calls(), 1);
        assert!(n1.marker().is_dead());
    }

    struct EmptyResolver;

    #[async_trait]
    impl Resolver for EmptyResolver {
        async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn empty_resolution_is_terminal() {
        let (chain, dialer) = failing_chain();
        let router = Router::new()
            .with_chain(chain)
            .with_resolver(Arc::new(EmptyResolver))
            .with_retries(5);

        let err = router
            .dial(Network::Tcp, &target("nosuch.example.com:80"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Resolve(_)));
        assert_eq!(dialer.calls(), 0, "no dial after a failed resolve");
    }

    #[tokio::test]
    async fn host_mapper_wins_over_resolver() {
        use passage_core::hosts::StaticHosts;

        let dialer = Arc::new(StubDialer::ok());
        let node = Arc::new(node_with(
            "hop",
            dialer.clone(),
            Arc::new(StubConnector::default()),
        ));
        let chain =
            Arc::new(Chain::new("c").add_hop(Hop::with_strategy("hop0", vec![node], Strategy::Fifo)));
        let hosts: StaticHosts = [("pinned.example.com", "192.0.2.10".parse().unwrap())]
            .into_iter()
            .collect();

        let router = Router::new()
            .with_chain(chain)
            .with_hosts(Arc::new(hosts))
            .with_resolver(Arc::new(EmptyResolver));

        // EmptyResolver would fail this; the mapper entry must win.
        router
            .dial(Network::Tcp, &target("pinned.example.com:80"))
            .await
            .unwrap();
        assert_eq!(dialer.calls(), 1);
    }

    #[tokio::test]
    async fn direct_ip_targets_skip_resolution() {
        let router = Router::new().with_resolver(Arc::new(EmptyResolver));
        let resolved = router.resolve(&target("192.0.2.1:443")).await.unwrap();
        assert_eq!(resolved, target("192.0.2.1:443"));
    }
}
