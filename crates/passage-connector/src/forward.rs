//! Null connector.

use async_trait::async_trait;

use passage_core::addr::{Address, Network};
use passage_core::contract::{Connector, ConnectorOptions, Stream};
use passage_core::error::Result;

/// Passes the hop connection through untouched; the hop itself decides
/// where bytes go. Used for chains whose last hop is a plain forwarder.
#[derive(Default)]
pub struct ForwardConnector;

impl ForwardConnector {
    pub fn new(_opts: &ConnectorOptions) -> Self {
        Self
    }
}

#[async_trait]
impl Connector for ForwardConnector {
    async fn connect(&self, stream: Stream, _network: Network, _target: &Address) -> Result<Stream> {
        Ok(stream)
    }
}
