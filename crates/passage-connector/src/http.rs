//! HTTP CONNECT connector.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use passage_core::addr::{Address, Network};
use passage_core::contract::{Connector, ConnectorOptions, Credentials, Stream};
use passage_core::error::{Error, Result};

/// Issues `CONNECT target` to an HTTP proxy hop.
///
/// Metadata: `connectTimeout` (deadline around the exchange).
pub struct HttpConnector {
    auth: Option<Credentials>,
    connect_timeout: Duration,
}

impl HttpConnector {
    pub fn new(opts: &ConnectorOptions) -> Self {
        Self {
            auth: opts.auth.clone(),
            connect_timeout: opts.metadata.get_duration("connectTimeout"),
        }
    }

    async fn exchange(&self, stream: Stream, target: &Address) -> Result<Stream> {
        // the reply may be followed immediately by tunnel bytes, so the
        // buffered reader stays part of the returned stream
        let mut stream = BufReader::new(stream);

        let mut request = format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\n"
        );
        if let Some(auth) = &self.auth {
            let token = BASE64.encode(format!("{}:{}", auth.username, auth.password));
            request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut status_line = String::new();
        stream.read_line(&mut status_line).await?;
        let status = parse_status(&status_line)?;

        // drain response headers
        loop {
            let mut line = String::new();
            let n = stream.read_line(&mut line).await?;
            if n == 0 {
                return Err(Error::Protocol("proxy closed during reply".into()));
            }
            if line == "\r\n" || line == "\n" {
                break;
            }
        }

        match status {
            200..=299 => {
                debug!(target = %target, "http tunnel established");
                Ok(Box::new(stream))
            }
            407 => Err(Error::Auth),
            403 => Err(Error::Refused(format!("proxy refused {target}"))),
            other => Err(Error::Unavailable(format!("proxy answered {other}"))),
        }
    }
}

fn parse_status(line: &str) -> Result<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") {
        return Err(Error::Protocol(format!("bad status line {line:?}")));
    }
    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("bad status line {line:?}")))
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, stream: Stream, network: Network, target: &Address) -> Result<Stream> {
        if network == Network::Udp {
            return Err(Error::Unsupported("udp over http connect"));
        }
        if self.connect_timeout.is_zero() {
            return self.exchange(stream, target).await;
        }
        tokio::time::timeout(self.connect_timeout, self.exchange(stream, target))
            .await
            .map_err(|_| Error::timeout("http connect"))?
    }
}
