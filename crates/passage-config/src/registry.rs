//! Process-wide plugin registries.
//!
//! One name-to-factory map per plugin kind, populated once by
//! [`register_builtins`] before the first service starts. Runtime paths
//! hold direct references to constructed instances; the registries are
//! consulted only while building services from configuration.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Once};

use once_cell::sync::Lazy;

use passage_chain::Router;
use passage_connector::{
    ForwardConnector, HttpConnector, RelayConnector, SniConnector, Socks4Connector,
    Socks5Connector, SsConnector,
};
use passage_core::contract::{
    Connector, ConnectorOptions, Dialer, DialerOptions, Handler, Listener,
};
use passage_core::error::Result;
use passage_core::metadata::Metadata;
use passage_core::registry::Registry;
use passage_handler::{
    AutoHandler, ForwardHandler, HandlerOptions, HttpHandler, RedirectHandler, SniHandler,
    Socks4Handler, Socks5Handler, SsHandler,
};
use passage_service::{ReverseTcpListener, ReverseUdpListener};
use passage_transport::{
    H2Dialer, H2Listener, TcpDialer, TcpStreamListener, TlsDialer, TlsListener, UdpDialer,
    UdpSessionListener, WsDialer, WsListener,
};

pub type DialerFactory = Arc<dyn Fn(&DialerOptions) -> Result<Arc<dyn Dialer>> + Send + Sync>;
pub type ConnectorFactory =
    Arc<dyn Fn(&ConnectorOptions) -> Result<Arc<dyn Connector>> + Send + Sync>;
pub type HandlerFactory = Arc<dyn Fn(&HandlerOptions) -> Result<Arc<dyn Handler>> + Send + Sync>;

/// Listener construction is asynchronous (it binds sockets), so the
/// factory returns a boxed future.
pub struct ListenerOptions {
    pub addr: String,
    pub metadata: Metadata,
    /// Reverse listeners bind through this router.
    pub router: Option<Arc<Router>>,
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type ListenerFactory = Arc<dyn Fn(ListenerOptions) -> BoxFuture<Result<Arc<dyn Listener>>> + Send + Sync>;

pub static DIALERS: Lazy<Registry<DialerFactory>> = Lazy::new(Registry::new);
pub static CONNECTORS: Lazy<Registry<ConnectorFactory>> = Lazy::new(Registry::new);
pub static HANDLERS: Lazy<Registry<HandlerFactory>> = Lazy::new(Registry::new);
pub static LISTENERS: Lazy<Registry<ListenerFactory>> = Lazy::new(Registry::new);

static BUILTINS: Once = Once::new();

/// Register every builtin plugin. Idempotent; call during startup
/// before the first service is built.
pub fn register_builtins() {
    BUILTINS.call_once(|| {
        register_dialers().expect("builtin dialer names are unique");
        register_connectors().expect("builtin connector names are unique");
        register_handlers().expect("builtin handler names are unique");
        register_listeners().expect("builtin listener names are unique");
    });
}

fn register_dialers() -> Result<()> {
    let tcp: DialerFactory = Arc::new(|opts| Ok(Arc::new(TcpDialer::new(opts)) as _));
    DIALERS.register("tcp", tcp)?;
    let udp: DialerFactory = Arc::new(|opts| Ok(Arc::new(UdpDialer::new(opts)) as _));
    DIALERS.register("udp", udp)?;
    let tls: DialerFactory = Arc::new(|opts| Ok(Arc::new(TlsDialer::new(opts)?) as _));
    DIALERS.register("tls", tls)?;
    let ws: DialerFactory = Arc::new(|opts| Ok(Arc::new(WsDialer::new(opts)?) as _));
    DIALERS.register("ws", ws)?;
    let wss: DialerFactory = Arc::new(|opts| Ok(Arc::new(WsDialer::new_secure(opts)?) as _));
    DIALERS.register("wss", wss)?;
    let h2: DialerFactory = Arc::new(|opts| Ok(Arc::new(H2Dialer::new(opts)?) as _));
    DIALERS.register("h2", h2.clone())?;
    DIALERS.register("http2", h2)?;
    Ok(())
}

fn register_connectors() -> Result<()> {
    let http: ConnectorFactory = Arc::new(|opts| Ok(Arc::new(HttpConnector::new(opts)) as _));
    CONNECTORS.register("http", http)?;
    let socks5: ConnectorFactory = Arc::new(|opts| Ok(Arc::new(Socks5Connector::new(opts)) as _));
    CONNECTORS.register("socks5", socks5.clone())?;
    CONNECTORS.register("socks", socks5)?;
    let socks4: ConnectorFactory = Arc::new(|opts| Ok(Arc::new(Socks4Connector::new(opts)) as _));
    CONNECTORS.register("socks4", socks4)?;
    let socks4a: ConnectorFactory =
        Arc::new(|opts| Ok(Arc::new(Socks4Connector::new_4a(opts)) as _));
    CONNECTORS.register("socks4a", socks4a)?;
    let ss: ConnectorFactory = Arc::new(|opts| Ok(Arc::new(SsConnector::new(opts)?) as _));
    CONNECTORS.register("ss", ss)?;
    let relay: ConnectorFactory = Arc::new(|opts| Ok(Arc::new(RelayConnector::new(opts)) as _));
    CONNECTORS.register("relay", relay)?;
    let forward: ConnectorFactory = Arc::new(|opts| Ok(Arc::new(ForwardConnector::new(opts)) as _));
    CONNECTORS.register("forward", forward)?;
    let sni: ConnectorFactory = Arc::new(|opts| Ok(Arc::new(SniConnector::new(opts)) as _));
    CONNECTORS.register("sni", sni)?;
    Ok(())
}

fn register_handlers() -> Result<()> {
    let http: HandlerFactory = Arc::new(|opts| Ok(Arc::new(HttpHandler::new(opts)) as _));
    HANDLERS.register("http", http)?;
    let socks5: HandlerFactory = Arc::new(|opts| Ok(Arc::new(Socks5Handler::new(opts)) as _));
    HANDLERS.register("socks5", socks5.clone())?;
    HANDLERS.register("socks", socks5)?;
    let socks4: HandlerFactory = Arc::new(|opts| Ok(Arc::new(Socks4Handler::new(opts)) as _));
    HANDLERS.register("socks4", socks4.clone())?;
    HANDLERS.register("socks4a", socks4)?;
    let ss: HandlerFactory = Arc::new(|opts| Ok(Arc::new(SsHandler::new(opts)?) as _));
    HANDLERS.register("ss", ss)?;
    let sni: HandlerFactory = Arc::new(|opts| Ok(Arc::new(SniHandler::new(opts)) as _));
    HANDLERS.register("sni", sni)?;
    let auto: HandlerFactory = Arc::new(|opts| Ok(Arc::new(AutoHandler::new(opts)) as _));
    HANDLERS.register("auto", auto)?;
    let redirect: HandlerFactory = Arc::new(|opts| Ok(Arc::new(RedirectHandler::new(opts)) as _));
    HANDLERS.register("red", redirect.clone())?;
    HANDLERS.register("redirect", redirect)?;

    // local and remote port forwarding share one handler; the network
    // comes in through metadata seeded by the builder
    let forward: HandlerFactory = Arc::new(|opts| Ok(Arc::new(ForwardHandler::new(opts)?) as _));
    HANDLERS.register("tcp", forward.clone())?;
    HANDLERS.register("udp", forward.clone())?;
    HANDLERS.register("rtcp", forward.clone())?;
    HANDLERS.register("rudp", forward)?;
    Ok(())
}

fn register_listeners() -> Result<()> {
    let tcp: ListenerFactory = Arc::new(|opts| {
        Box::pin(async move {
            Ok(Arc::new(TcpStreamListener::bind_with(&opts.addr, &opts.metadata).await?) as _)
        })
    });
    LISTENERS.register("tcp", tcp)?;

    let udp: ListenerFactory = Arc::new(|opts| {
        Box::pin(async move {
            Ok(Arc::new(UdpSessionListener::bind_with(&opts.addr, &opts.metadata).await?) as _)
        })
    });
    LISTENERS.register("udp", udp)?;

    let tls: ListenerFactory = Arc::new(|opts| {
        Box::pin(
            async move { Ok(Arc::new(TlsListener::bind(&opts.addr, &opts.metadata).await?) as _) },
        )
    });
    LISTENERS.register("tls", tls)?;

    let ws: ListenerFactory = Arc::new(|opts| {
        Box::pin(
            async move { Ok(Arc::new(WsListener::bind(&opts.addr, &opts.metadata).await?) as _) },
        )
    });
    LISTENERS.register("ws", ws.clone())?;
    LISTENERS.register("wss", ws)?;

    let h2: ListenerFactory = Arc::new(|opts| {
        Box::pin(
            async move { Ok(Arc::new(H2Listener::bind(&opts.addr, &opts.metadata).await?) as _) },
        )
    });
    LISTENERS.register("h2", h2.clone())?;
    LISTENERS.register("http2", h2)?;

    let rtcp: ListenerFactory = Arc::new(|opts| {
        Box::pin(async move {
            let router = opts.router.unwrap_or_else(|| Arc::new(Router::new()));
            let addr = opts.addr.parse()?;
            Ok(Arc::new(ReverseTcpListener::new(addr, router)) as _)
        })
    });
    LISTENERS.register("rtcp", rtcp)?;

    let rudp: ListenerFactory = Arc::new(|opts| {
        Box::pin(async move {
            let router = opts.router.unwrap_or_else(|| Arc::new(Router::new()));
            let addr = opts.addr.parse()?;
            Ok(Arc::new(ReverseUdpListener::new(addr, router)) as _)
        })
    });
    LISTENERS.register("rudp", rudp)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_register_once() {
        register_builtins();
        register_builtins(); // idempotent
        for name in ["tcp", "udp", "tls", "ws", "wss", "h2"] {
            assert!(DIALERS.get(name).is_some(), "dialer {name}");
        }
        for name in ["http", "socks4", "socks4a", "socks5", "ss", "relay", "forward", "sni"] {
            assert!(CONNECTORS.get(name).is_some(), "connector {name}");
        }
        for name in ["http", "socks5", "socks4", "ss", "sni", "auto", "red", "tcp", "udp"] {
            assert!(HANDLERS.get(name).is_some(), "handler {name}");
        }
        for name in ["tcp", "udp", "tls", "ws", "h2", "rtcp", "rudp"] {
            assert!(LISTENERS.get(name).is_some(), "listener {name}");
        }
        assert!(DIALERS.get("kcp").is_none());
    }
}
