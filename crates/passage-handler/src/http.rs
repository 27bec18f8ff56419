//! HTTP proxy handler: CONNECT tunnels, plain-HTTP forwarding, probe
//! resistance, and the legacy target-override header.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use passage_chain::Router;
use passage_connector::relay::FramedUdpStream;
use passage_core::addr::{Address, Network};
use passage_core::contract::{Auther, Bypass, ConnMeta, Credentials, Handler, Stream};
use passage_core::error::{Error, Result};
use passage_core::io::relay_streams;

use crate::{HandlerOptions, RelaySettings};

const MAX_HEAD_BYTES: usize = 16384;

/// Legacy target-override headers, validated by CRC32.
const TARGET_HEADERS: [&str; 2] = ["Gost-Target", "X-Gost-Target"];
/// Selects UDP relay mode over an HTTP connection.
const PROTOCOL_HEADER: &str = "X-Gost-Protocol";

/// What to answer when authentication fails and the knock host does
/// not match, instead of the 407 challenge.
#[derive(Debug, Clone)]
enum ProbeResistance {
    Code(u16),
    Web(String),
    Host(String),
    File(PathBuf),
}

impl ProbeResistance {
    fn parse(value: &str) -> Option<Self> {
        let (kind, arg) = value.split_once(':')?;
        match kind {
            "code" => arg.parse().ok().map(ProbeResistance::Code),
            "web" => Some(ProbeResistance::Web(arg.to_string())),
            "host" => Some(ProbeResistance::Host(arg.to_string())),
            "file" => Some(ProbeResistance::File(PathBuf::from(arg))),
            _ => None,
        }
    }
}

pub struct HttpHandler {
    router: Arc<Router>,
    auther: Option<Arc<dyn Auther>>,
    bypass: Option<Arc<dyn Bypass>>,
    settings: RelaySettings,
    probe_resistance: Option<ProbeResistance>,
    knock: Option<String>,
    /// Accept origin-form requests (set when embedded behind the SNI
    /// handler, which feeds it plain web traffic).
    relaxed: bool,
}

impl HttpHandler {
    pub fn new(opts: &HandlerOptions) -> Self {
        let md = &opts.metadata;
        Self {
            router: opts.router.clone(),
            auther: opts.auther.clone(),
            bypass: opts.bypass.clone(),
            settings: RelaySettings::from_metadata(md),
            probe_resistance: ProbeResistance::parse(md.get_str("probeResistance")),
            knock: match md.get_str("knock") {
                "" => None,
                k => Some(k.to_ascii_lowercase()),
            },
            relaxed: md.get_bool("sni"),
        }
    }

    async fn serve(&self, mut stream: Stream, meta: ConnMeta) -> Result<()> {
        let (head, leftover) = read_head(&mut stream, self.settings.read_timeout).await?;
        let mut req = ParsedRequest::parse(&head)?;

        // legacy target override, CRC-validated; tampered blobs are
        // ignored and stripped
        for header in TARGET_HEADERS {
            if let Some(value) = req.header(header) {
                if let Some(host) = decode_target_blob(&value) {
                    req.host = Some(host);
                }
                req.remove_header(header);
            }
        }
        let network = match req.header(PROTOCOL_HEADER).as_deref() {
            Some("udp") => Network::Udp,
            _ => Network::Tcp,
        };
        req.remove_header(PROTOCOL_HEADER);

        let Some(target) = req.target() else {
            write_simple(&mut stream, 400, "Bad Request").await?;
            return Err(Error::Protocol("no target host in request".into()));
        };

        info!(peer = %meta.peer, target = %target, method = %req.method, "http request");

        if let Some(bypass) = &self.bypass {
            if bypass.contains(&target) {
                info!(peer = %meta.peer, target = %target, "bypass refused");
                write_simple(&mut stream, 403, "Forbidden").await?;
                return Ok(());
            }
        }

        if !self.authenticate(&req).await {
            return self.reject_unauthenticated(stream, &req, &head, &leftover).await;
        }
        req.remove_header("Proxy-Authorization");

        if network == Network::Udp {
            return self.serve_udp(stream, leftover, &target).await;
        }

        if req.method == "CONNECT" {
            let upstream = match self.router.dial(Network::Tcp, &target).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(peer = %meta.peer, target = %target, error = %e, "dial failed");
                    write_simple(&mut stream, 503, "Service Unavailable").await?;
                    return Err(e);
                }
            };
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await?;
            stream.flush().await?;
            let mut upstream = upstream;
            if !leftover.is_empty() {
                upstream.write_all(&leftover).await?;
            }
            self.relay(stream, upstream, &target).await
        } else {
            if !self.relaxed && !req.is_absolute_uri() {
                write_simple(&mut stream, 400, "Bad Request").await?;
                return Err(Error::Protocol("origin-form request to a proxy".into()));
            }
            let mut upstream = match self.router.dial(Network::Tcp, &target).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(peer = %meta.peer, target = %target, error = %e, "dial failed");
                    write_simple(&mut stream, 503, "Service Unavailable").await?;
                    return Err(e);
                }
            };
            req.remove_header("Proxy-Connection");
            upstream.write_all(&req.to_origin_form()).await?;
            if !leftover.is_empty() {
                upstream.write_all(&leftover).await?;
            }
            upstream.flush().await?;
            self.relay(stream, upstream, &target).await
        }
    }

    /// Datagrams over the HTTP connection, length-prefixed both ways.
    async fn serve_udp(&self, mut stream: Stream, leftover: Vec<u8>, target: &Address) -> Result<()> {
        let upstream = self.router.dial(Network::Udp, target).await?;
        stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
        stream.flush().await?;
        if !leftover.is_empty() {
            // framing starts strictly after the reply
            return Err(Error::Protocol("early data in udp mode".into()));
        }
        let client = FramedUdpStream::new(stream);
        let stats = relay_streams(
            client,
            upstream,
            self.settings.buffer_size,
            self.settings.idle_timeout,
        )
        .await?;
        debug!(target = %target, bytes = stats.total(), "udp relay finished");
        Ok(())
    }

    async fn relay(&self, client: Stream, upstream: Stream, target: &Address) -> Result<()> {
        let stats = relay_streams(
            client,
            upstream,
            self.settings.buffer_size,
            self.settings.idle_timeout,
        )
        .await?;
        debug!(target = %target, up = stats.a_to_b, down = stats.b_to_a, "relay finished");
        Ok(())
    }

    async fn authenticate(&self, req: &ParsedRequest) -> bool {
        let Some(auther) = &self.auther else {
            return true;
        };
        match req.basic_credentials() {
            Some(creds) => auther.authenticate(&creds.username, &creds.password).await,
            None => false,
        }
    }

    /// Answer an unauthenticated request: the configured probe-resistance
    /// action when the knock host does not match, the 407 challenge
    /// otherwise.
    async fn reject_unauthenticated(
        &self,
        mut stream: Stream,
        req: &ParsedRequest,
        head: &[u8],
        leftover: &[u8],
    ) -> Result<()> {
        let knocked = self
            .knock
            .as_ref()
            .is_some_and(|knock| req.host_name().is_some_and(|h| h.eq_ignore_ascii_case(knock)));

        if let (Some(pr), false) = (&self.probe_resistance, knocked) {
            debug!("auth failed, probe resistance engaged");
            match pr {
                ProbeResistance::Code(code) => {
                    write_simple(&mut stream, *code, status_text(*code)).await?;
                }
                ProbeResistance::Web(url) => {
                    if let Err(e) = reverse_fetch(&mut stream, url).await {
                        debug!(error = %e, "probe resistance fetch failed");
                        write_simple(&mut stream, 503, "Service Unavailable").await?;
                    }
                }
                ProbeResistance::Host(host_port) => {
                    if let Ok(addr) = host_port.parse::<Address>() {
                        if let Ok(mut upstream) = self.router.dial(Network::Tcp, &addr).await {
                            upstream.write_all(head).await?;
                            upstream.write_all(leftover).await?;
                            upstream.flush().await?;
                            return self.relay(stream, upstream, &addr).await;
                        }
                    }
                    write_simple(&mut stream, 503, "Service Unavailable").await?;
                }
                ProbeResistance::File(path) => {
                    match tokio::fs::read(path).await {
                        Ok(body) => {
                            let head = format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n",
                                body.len()
                            );
                            stream.write_all(head.as_bytes()).await?;
                            stream.write_all(&body).await?;
                        }
                        Err(_) => write_simple(&mut stream, 404, "Not Found").await?,
                    }
                }
            }
            stream.flush().await?;
            return Err(Error::Auth);
        }

        info!("proxy authentication required");
        stream
            .write_all(
                b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                  Proxy-Authenticate: Basic realm=\"passage\"\r\n\
                  Connection: close\r\n\r\n",
            )
            .await?;
        stream.flush().await?;
        Err(Error::Auth)
    }
}

#[async_trait]
impl Handler for HttpHandler {
    async fn handle(&self, stream: Stream, meta: ConnMeta) -> Result<()> {
        self.serve(stream, meta).await
    }
}

// ── request head parsing ──

pub(crate) struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub host: Option<String>,
}

impl ParsedRequest {
    pub fn parse(head: &[u8]) -> Result<Self> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(Error::Protocol("truncated request head".into()));
            }
            Err(e) => return Err(Error::Protocol(format!("bad request head: {e}"))),
        }

        let method = parsed.method.unwrap_or("").to_string();
        let path = parsed.path.unwrap_or("").to_string();
        let headers: Vec<(String, String)> = parsed
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect();
        if method.is_empty() {
            return Err(Error::Protocol("empty method".into()));
        }

        let mut req = Self {
            method,
            path,
            headers,
            host: None,
        };
        req.host = req.derive_host();
        Ok(req)
    }

    fn derive_host(&self) -> Option<String> {
        if self.method == "CONNECT" {
            return Some(self.path.clone());
        }
        if let Some(rest) = self.path.strip_prefix("http://") {
            let authority = rest.split('/').next().unwrap_or(rest);
            if !authority.is_empty() {
                return Some(authority.to_string());
            }
        }
        self.header("Host")
    }

    pub fn is_absolute_uri(&self) -> bool {
        self.path.starts_with("http://")
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Routed target, defaulting the port to 80.
    pub fn target(&self) -> Option<Address> {
        let host = self.host.clone()?;
        if let Ok(addr) = host.parse::<Address>() {
            return Some(addr);
        }
        format!("{host}:80").parse().ok()
    }

    pub fn host_name(&self) -> Option<String> {
        self.target().map(|t| t.host_str())
    }

    pub fn basic_credentials(&self) -> Option<Credentials> {
        let value = self.header("Proxy-Authorization")?;
        let encoded = value.strip_prefix("Basic ")?;
        let decoded = BASE64.decode(encoded).ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let (user, pass) = text.split_once(':')?;
        Some(Credentials::new(user, pass))
    }

    /// Rebuild the head in origin form for upstream delivery.
    pub fn to_origin_form(&self) -> Vec<u8> {
        let path = if let Some(rest) = self.path.strip_prefix("http://") {
            match rest.find('/') {
                Some(i) => &rest[i..],
                None => "/",
            }
        } else {
            self.path.as_str()
        };
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, path).into_bytes();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Read until the end of the request head; returns the head bytes and
/// whatever arrived beyond them.
pub(crate) async fn read_head(
    stream: &mut Stream,
    timeout: std::time::Duration,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            let head = buf[..end].to_vec();
            let leftover = buf[end..].to_vec();
            return Ok((head, leftover));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(Error::Protocol("request head too large".into()));
        }
        let n = tokio::time::timeout_at(deadline, stream.read_buf(&mut buf))
            .await
            .map_err(|_| Error::timeout("request head read"))??;
        if n == 0 {
            return Err(Error::Protocol("connection closed mid-head".into()));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Decode `base64url(crc32(name) || base64url(name))`, rejecting
/// malformed or tampered blobs.
pub(crate) fn decode_target_blob(value: &str) -> Option<String> {
    let outer = BASE64_URL.decode(value).ok()?;
    if outer.len() < 4 {
        return None;
    }
    let name = BASE64_URL.decode(&outer[4..]).ok()?;
    let expected = u32::from_be_bytes(outer[..4].try_into().ok()?);
    if crc32fast::hash(&name) != expected {
        return None;
    }
    String::from_utf8(name).ok()
}

/// Counterpart of [`decode_target_blob`], used by chained setups to
/// smuggle the real target.
pub fn encode_target_blob(name: &str) -> String {
    let inner = BASE64_URL.encode(name.as_bytes());
    let mut raw = crc32fast::hash(name.as_bytes()).to_be_bytes().to_vec();
    raw.extend_from_slice(inner.as_bytes());
    BASE64_URL.encode(raw)
}

async fn write_simple(stream: &mut Stream, code: u16, text: &str) -> Result<()> {
    let reply = format!("HTTP/1.1 {code} {text}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
    stream.write_all(reply.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "OK",
    }
}

/// Fetch a URL over a fresh direct connection and stream the response
/// back; backs the `web:` probe-resistance mode.
async fn reverse_fetch(stream: &mut Stream, url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("http://")
        .unwrap_or(url);
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let addr: Address = if authority.contains(':') {
        authority.parse()?
    } else {
        Address::domain(authority, 80)
    };

    let mut upstream = tokio::net::TcpStream::connect(addr.to_string())
        .await
        .map_err(|e| Error::Unavailable(format!("connect {addr}: {e}")))?;
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {authority}\r\nConnection: close\r\n\r\n"
    );
    upstream.write_all(request.as_bytes()).await?;
    upstream.flush().await?;
    tokio::io::copy(&mut upstream, stream).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_blob_round_trips() {
        let blob = encode_target_blob("hidden.example.com:8443");
        assert_eq!(
            decode_target_blob(&blob).as_deref(),
            Some("hidden.example.com:8443")
        );
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let blob = encode_target_blob("hidden.example.com:8443");
        let mut raw = BASE64_URL.decode(&blob).unwrap();
        raw[0] ^= 0xFF; // break the checksum
        let tampered = BASE64_URL.encode(raw);
        assert_eq!(decode_target_blob(&tampered), None);
        assert_eq!(decode_target_blob("not base64 !!"), None);
        assert_eq!(decode_target_blob(""), None);
    }

    #[test]
    fn connect_target_comes_from_the_request_line() {
        let head = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let req = ParsedRequest::parse(head).unwrap();
        assert_eq!(req.method, "CONNECT");
        assert_eq!(req.target().unwrap().to_string(), "example.com:443");
    }

    #[test]
    fn absolute_uri_target_defaults_to_port_80() {
        let head = b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let req = ParsedRequest::parse(head).unwrap();
        assert!(req.is_absolute_uri());
        assert_eq!(req.target().unwrap().to_string(), "example.com:80");
    }

    #[test]
    fn origin_form_strips_the_authority() {
        let head =
            b"GET http://example.com/a/b?q=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let mut req = ParsedRequest::parse(head).unwrap();
        req.remove_header("Accept");
        let rebuilt = String::from_utf8(req.to_origin_form()).unwrap();
        assert!(rebuilt.starts_with("GET /a/b?q=1 HTTP/1.1\r\n"));
        assert!(!rebuilt.contains("Accept"));
    }

    #[test]
    fn basic_credentials_decode() {
        let token = BASE64.encode("alice:secret");
        let head = format!(
            "CONNECT example.com:443 HTTP/1.1\r\nProxy-Authorization: Basic {token}\r\n\r\n"
        );
        let req = ParsedRequest::parse(head.as_bytes()).unwrap();
        let creds = req.basic_credentials().unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "secret");
    }

    #[test]
    fn garbage_head_is_a_protocol_error() {
        let err = ParsedRequest::parse(b"\x16\x03\x01 nonsense\r\n\r\n").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
