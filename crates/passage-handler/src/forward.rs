//! Port forward handler.
//!
//! Forwards every accepted connection (or UDP session) to one of a
//! fixed set of targets. Targets carry their own failure markers,
//! separate from chain-node markers: a dead chain hop is marked inside
//! the route, not here.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info, warn};

use passage_chain::{Marker, Router, Strategy};
use passage_core::addr::{Address, Network};
use passage_core::contract::{ConnMeta, Handler, Stream};
use passage_core::error::{Error, Result};
use passage_core::io::relay_streams;

use crate::{HandlerOptions, RelaySettings};

struct ForwardTarget {
    addr: Address,
    marker: Marker,
}

pub struct ForwardHandler {
    router: Arc<Router>,
    settings: RelaySettings,
    targets: Vec<ForwardTarget>,
    strategy: Strategy,
    cursor: AtomicUsize,
    network: Network,
}

impl ForwardHandler {
    /// Metadata: `targets` (list of `host:port`), `strategy`
    /// (round/rand/fifo), `network` (`udp` for datagram services).
    pub fn new(opts: &HandlerOptions) -> Result<Self> {
        let md = &opts.metadata;
        let targets: Vec<ForwardTarget> = md
            .get_str_list("targets")
            .iter()
            .map(|t| {
                t.parse().map(|addr| ForwardTarget {
                    addr,
                    marker: Marker::default(),
                })
            })
            .collect::<Result<_>>()?;
        if targets.is_empty() {
            return Err(Error::Protocol("forward handler needs targets".into()));
        }
        Ok(Self {
            router: opts.router.clone(),
            settings: RelaySettings::from_metadata(md),
            targets,
            strategy: Strategy::parse(md.get_str("strategy")),
            cursor: AtomicUsize::new(0),
            network: match md.get_str("network") {
                "udp" => Network::Udp,
                _ => Network::Tcp,
            },
        })
    }

    /// Live targets first, retry-soonest fallback, strategy on top.
    fn select(&self) -> &ForwardTarget {
        let live: Vec<&ForwardTarget> = self
            .targets
            .iter()
            .filter(|t| !t.marker.is_dead())
            .collect();
        let candidates = if live.is_empty() {
            let soonest = self
                .targets
                .iter()
                .min_by_key(|t| t.marker.dead_until_ms())
                .expect("targets are non-empty");
            vec![soonest]
        } else {
            live
        };
        match self.strategy {
            Strategy::RoundRobin => {
                let i = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates[i]
            }
            Strategy::Random => candidates[rand::thread_rng().gen_range(0..candidates.len())],
            Strategy::Fifo => candidates[0],
        }
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    async fn handle(&self, stream: Stream, meta: ConnMeta) -> Result<()> {
        let target = self.select();
        info!(peer = %meta.peer, target = %target.addr, network = %self.network, "forwarding");

        let upstream = match self.router.dial(self.network, &target.addr).await {
            Ok(s) => s,
            Err(e) => {
                warn!(peer = %meta.peer, target = %target.addr, error = %e, "dial failed");
                // attribute the failure to the target only on a direct
                // dial; chain failures were already marked on the nodes
                if !self.router.has_chain() {
                    target.marker.mark();
                }
                return Err(e);
            }
        };
        target.marker.reset();

        let stats = relay_streams(
            stream,
            upstream,
            self.settings.buffer_size,
            self.settings.idle_timeout,
        )
        .await?;
        debug!(peer = %meta.peer, target = %target.addr, bytes = stats.total(), "relay finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passage_core::metadata::Metadata;
    use serde_json_shim::json_list;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    mod serde_json_shim {
        pub fn json_list(items: &[&str]) -> serde_json::Value {
            serde_json::Value::Array(
                items
                    .iter()
                    .map(|s| serde_json::Value::String(s.to_string()))
                    .collect(),
            )
        }
    }

    fn handler(targets: &[&str], strategy: &str) -> ForwardHandler {
        let mut md = Metadata::new();
        md.set("targets", json_list(targets));
        md.set("strategy", strategy);
        let opts = HandlerOptions::new(Arc::new(Router::new())).with_metadata(md);
        ForwardHandler::new(&opts).unwrap()
    }

    #[tokio::test]
    async fn forwards_tcp_to_the_configured_target() {
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = target.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut s, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 2];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(b"ok").await.unwrap();
        });

        let h = handler(&[&addr], "fifo");
        let (mut client, server_side) = duplex(1024);
        let served = tokio::spawn(async move {
            h.handle(
                Box::new(server_side),
                ConnMeta::new("127.0.0.1:3333".parse().unwrap()),
            )
            .await
        });

        client.write_all(b"go").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        drop(client);
        served.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn round_robin_rotates_targets() {
        let h = handler(&["127.0.0.1:1001", "127.0.0.1:1002"], "round");
        let picks: Vec<String> = (0..4).map(|_| h.select().addr.to_string()).collect();
        assert_eq!(
            picks,
            ["127.0.0.1:1001", "127.0.0.1:1002", "127.0.0.1:1001", "127.0.0.1:1002"]
        );
    }

    #[tokio::test]
    async fn dead_target_is_skipped_until_marked_live() {
        let h = handler(&["127.0.0.1:1001", "127.0.0.1:1002"], "fifo");
        h.targets[0].marker.mark();
        assert_eq!(h.select().addr.to_string(), "127.0.0.1:1002");
        h.targets[0].marker.reset();
        assert_eq!(h.select().addr.to_string(), "127.0.0.1:1001");
    }

    #[tokio::test]
    async fn direct_dial_failure_marks_the_target() {
        // port 1 is closed
        let h = handler(&["127.0.0.1:1"], "fifo");
        let (_client, server_side) = duplex(16);
        let err = h
            .handle(
                Box::new(server_side),
                ConnMeta::new("127.0.0.1:3333".parse().unwrap()),
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(h.targets[0].marker.is_dead());
    }

    #[test]
    fn empty_targets_is_a_configuration_error() {
        let opts = HandlerOptions::new(Arc::new(Router::new()));
        assert!(ForwardHandler::new(&opts).is_err());
    }
}
