//! Transparent redirect handler.
//!
//! The listener recovers the pre-NAT destination (SO_ORIGINAL_DST) and
//! passes it in the accept metadata; this handler just routes there.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use passage_chain::Router;
use passage_core::addr::{Address, Network};
use passage_core::contract::{Bypass, ConnMeta, Handler, Stream};
use passage_core::error::{Error, Result};
use passage_core::io::relay_streams;

use crate::{HandlerOptions, RelaySettings};

pub struct RedirectHandler {
    router: Arc<Router>,
    bypass: Option<Arc<dyn Bypass>>,
    settings: RelaySettings,
}

impl RedirectHandler {
    pub fn new(opts: &HandlerOptions) -> Self {
        Self {
            router: opts.router.clone(),
            bypass: opts.bypass.clone(),
            settings: RelaySettings::from_metadata(&opts.metadata),
        }
    }
}

#[async_trait]
impl Handler for RedirectHandler {
    async fn handle(&self, stream: Stream, meta: ConnMeta) -> Result<()> {
        let Some(dst) = meta.original_dst else {
            return Err(Error::Unsupported("original destination"));
        };
        let target: Address = dst.into();
        info!(peer = %meta.peer, target = %target, "redirected connection");

        if let Some(bypass) = &self.bypass {
            if bypass.contains(&target) {
                info!(peer = %meta.peer, target = %target, "bypass refused");
                return Ok(());
            }
        }

        let upstream = match self.router.dial(Network::Tcp, &target).await {
            Ok(s) => s,
            Err(e) => {
                warn!(peer = %meta.peer, target = %target, error = %e, "dial failed");
                return Err(e);
            }
        };
        let stats = relay_streams(
            stream,
            upstream,
            self.settings.buffer_size,
            self.settings.idle_timeout,
        )
        .await?;
        debug!(peer = %meta.peer, target = %target, bytes = stats.total(), "relay finished");
        Ok(())
    }
}
