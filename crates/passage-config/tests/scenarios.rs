//! End-to-end scenarios: services built from configuration, exercised
//! over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use passage_config::{
    ChainConfig, Config, ConnectorConfig, DialerConfig, ForwarderConfig, HandlerConfig,
    HopConfig, ListenerConfig, NodeConfig, SelectorConfig, ServiceConfig, build_services,
};
use passage_connector::Socks5Connector;
use passage_core::addr::Network;
use passage_core::contract::{Connector, ConnectorOptions, Credentials, Stream};
use passage_service::Service;

/// Echo server that answers each connection by mirroring its bytes.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn start(config: &Config, shutdown: &CancellationToken) -> Vec<Arc<Service>> {
    let services = build_services(config).await.unwrap();
    for service in &services {
        service.clone().spawn(shutdown.clone());
    }
    services
}

fn service(name: &str, handler_kind: &str) -> ServiceConfig {
    ServiceConfig {
        name: name.into(),
        addr: "127.0.0.1:0".into(),
        handler: HandlerConfig {
            kind: handler_kind.into(),
            ..Default::default()
        },
        listener: ListenerConfig {
            kind: "tcp".into(),
            ..Default::default()
        },
        forwarder: None,
    }
}

fn hop_node(name: &str, addr: SocketAddr, connector: &str) -> NodeConfig {
    NodeConfig {
        name: name.into(),
        addr: addr.to_string(),
        connector: ConnectorConfig {
            kind: connector.into(),
            ..Default::default()
        },
        dialer: DialerConfig {
            kind: "tcp".into(),
            ..Default::default()
        },
        bypass: None,
    }
}

async fn socks5_connect(entry: SocketAddr, target: SocketAddr) -> Stream {
    let tcp = TcpStream::connect(entry).await.unwrap();
    let connector = Socks5Connector::new(&ConnectorOptions::default());
    let stream = connector.handshake(Box::new(tcp)).await.unwrap();
    connector
        .connect(stream, Network::Tcp, &target.into())
        .await
        .unwrap()
}

async fn assert_echo(stream: &mut Stream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    stream.flush().await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}

// S1: HTTP CONNECT, no chain: the reply comes before any relayed byte
// and the target connection is direct.
#[tokio::test]
async fn http_connect_direct() {
    let echo = spawn_echo().await;
    let shutdown = CancellationToken::new();
    let services = start(
        &Config {
            services: vec![service("web", "http")],
            ..Default::default()
        },
        &shutdown,
    )
    .await;
    let entry = services[0].listener().local_addr().unwrap();

    let mut client = TcpStream::connect(entry).await.unwrap();
    client
        .write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut head = [0u8; 39];
    client.read_exact(&mut head).await.unwrap();
    assert!(head.starts_with(b"HTTP/1.1 200 Connection established\r\n"));

    client.write_all(b"tunnel data").await.unwrap();
    let mut buf = [0u8; 11];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tunnel data");

    shutdown.cancel();
}

// S2: SOCKS5 ingress chained through one authenticated HTTP hop.
#[tokio::test]
async fn socks5_via_http_hop() {
    let echo = spawn_echo().await;
    let shutdown = CancellationToken::new();

    // the hop requires credentials
    let mut hop_cfg = service("hop", "http");
    hop_cfg.handler.auths = vec![passage_config::AuthConfig {
        username: "user".into(),
        password: "pw".into(),
    }];
    let services = start(
        &Config {
            services: vec![hop_cfg],
            ..Default::default()
        },
        &shutdown,
    )
    .await;
    let hop_addr = services[0].listener().local_addr().unwrap();

    // an unauthenticated CONNECT to the hop is challenged
    {
        let mut probe = TcpStream::connect(hop_addr).await.unwrap();
        probe
            .write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut head = [0u8; 12];
        probe.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"HTTP/1.1 407");
    }

    // entry speaks socks5 and forwards through the hop with credentials
    let mut node = hop_node("via-http", hop_addr, "http");
    node.connector.auth = Some(passage_config::AuthConfig {
        username: "user".into(),
        password: "pw".into(),
    });
    let entry_services = start(
        &Config {
            services: vec![ServiceConfig {
                handler: HandlerConfig {
                    kind: "socks5".into(),
                    chain: Some("out".into()),
                    ..Default::default()
                },
                ..service("entry", "socks5")
            }],
            chains: vec![ChainConfig {
                name: "out".into(),
                selector: None,
                hops: vec![HopConfig {
                    name: "hop0".into(),
                    selector: None,
                    nodes: vec![node],
                }],
            }],
            ..Default::default()
        },
        &shutdown,
    )
    .await;
    let entry = entry_services[0].listener().local_addr().unwrap();

    let mut stream = socks5_connect(entry, echo).await;
    assert_echo(&mut stream, b"through one hop").await;

    shutdown.cancel();
}

// S3: two-hop chain, SOCKS5 over SOCKS5, handshakes strictly in hop
// order.
#[tokio::test]
async fn two_hop_socks5_chain() {
    let echo = spawn_echo().await;
    let shutdown = CancellationToken::new();

    let hops = start(
        &Config {
            services: vec![service("hop-a", "socks5"), service("hop-b", "socks5")],
            ..Default::default()
        },
        &shutdown,
    )
    .await;
    let a = hops[0].listener().local_addr().unwrap();
    let b = hops[1].listener().local_addr().unwrap();

    let entry_services = start(
        &Config {
            services: vec![ServiceConfig {
                handler: HandlerConfig {
                    kind: "socks5".into(),
                    chain: Some("two".into()),
                    ..Default::default()
                },
                ..service("entry", "socks5")
            }],
            chains: vec![ChainConfig {
                name: "two".into(),
                selector: None,
                hops: vec![
                    HopConfig {
                        name: "first".into(),
                        selector: None,
                        nodes: vec![hop_node("a", a, "socks5")],
                    },
                    HopConfig {
                        name: "second".into(),
                        selector: None,
                        nodes: vec![hop_node("b", b, "socks5")],
                    },
                ],
            }],
            ..Default::default()
        },
        &shutdown,
    )
    .await;
    let entry = entry_services[0].listener().local_addr().unwrap();

    let mut stream = socks5_connect(entry, echo).await;
    assert_echo(&mut stream, b"across two hops").await;

    shutdown.cancel();
}

// S4: first attempt lands on the unreachable node, gets marked, and the
// retry succeeds on the survivor.
#[tokio::test]
async fn retry_across_marker() {
    let echo = spawn_echo().await;
    let shutdown = CancellationToken::new();

    let hops = start(
        &Config {
            services: vec![service("live-hop", "socks5")],
            ..Default::default()
        },
        &shutdown,
    )
    .await;
    let live = hops[0].listener().local_addr().unwrap();

    // a port that nothing listens on
    let dead = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);
        addr
    };

    let entry_services = start(
        &Config {
            services: vec![ServiceConfig {
                handler: HandlerConfig {
                    kind: "socks5".into(),
                    chain: Some("flaky".into()),
                    retries: 2,
                    ..Default::default()
                },
                ..service("entry", "socks5")
            }],
            chains: vec![ChainConfig {
                name: "flaky".into(),
                selector: None,
                hops: vec![HopConfig {
                    name: "hop0".into(),
                    selector: Some(SelectorConfig {
                        strategy: "round".into(),
                        ..Default::default()
                    }),
                    nodes: vec![
                        hop_node("dead", dead, "socks5"),
                        hop_node("live", live, "socks5"),
                    ],
                }],
            }],
            ..Default::default()
        },
        &shutdown,
    )
    .await;
    let entry = entry_services[0].listener().local_addr().unwrap();

    let mut stream = socks5_connect(entry, echo).await;
    assert_echo(&mut stream, b"survived a dead node").await;

    shutdown.cancel();
}

// S5: a non-TLS first byte on the SNI service restarts the flow as
// plain HTTP, replaying the consumed bytes.
#[tokio::test]
async fn sni_fallback_to_http() {
    // minimal HTTP origin
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await.unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
            .await
            .unwrap();
    });

    let shutdown = CancellationToken::new();
    let services = start(
        &Config {
            services: vec![service("peek", "sni")],
            ..Default::default()
        },
        &shutdown,
    )
    .await;
    let entry = services[0].listener().local_addr().unwrap();

    let mut client = TcpStream::connect(entry).await.unwrap();
    client
        .write_all(
            format!("GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK"), "got: {text}");
    assert!(text.ends_with("hi"));

    shutdown.cancel();
}

// S6: reverse TCP: the listener binds through the chain onto the hop,
// and inbound connections come back through it to the local target.
#[tokio::test]
async fn reverse_tcp_through_a_chain() {
    let echo = spawn_echo().await;
    let shutdown = CancellationToken::new();

    let hops = start(
        &Config {
            services: vec![service("bind-hop", "socks5")],
            ..Default::default()
        },
        &shutdown,
    )
    .await;
    let hop_addr = hops[0].listener().local_addr().unwrap();

    // the port the hop will open on our behalf
    let public = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);
        addr
    };

    let _reverse = start(
        &Config {
            services: vec![ServiceConfig {
                name: "reverse".into(),
                addr: public.to_string(),
                handler: HandlerConfig {
                    kind: "rtcp".into(),
                    ..Default::default()
                },
                listener: ListenerConfig {
                    kind: "rtcp".into(),
                    chain: Some("via".into()),
                    ..Default::default()
                },
                forwarder: Some(ForwarderConfig {
                    targets: vec![echo.to_string()],
                    selector: None,
                }),
            }],
            chains: vec![ChainConfig {
                name: "via".into(),
                selector: None,
                hops: vec![HopConfig {
                    name: "hop0".into(),
                    selector: None,
                    nodes: vec![hop_node("binder", hop_addr, "socks5")],
                }],
            }],
            ..Default::default()
        },
        &shutdown,
    )
    .await;

    // the remote bind happens on the reverse service's first accept;
    // poll until the public port answers
    let mut client = None;
    for _ in 0..50 {
        match TcpStream::connect(public).await {
            Ok(c) => {
                client = Some(c);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    let mut client = client.expect("public port never opened");

    client.write_all(b"inbound!").await.unwrap();
    let mut buf = [0u8; 8];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"inbound!");

    shutdown.cancel();
}

// The target-override header rides a real request end to end; a
// tampered blob leaves the request host untouched.
#[tokio::test]
async fn target_override_header_routes_the_request() {
    let echo = spawn_echo().await;
    let shutdown = CancellationToken::new();
    let services = start(
        &Config {
            services: vec![service("web", "http")],
            ..Default::default()
        },
        &shutdown,
    )
    .await;
    let entry = services[0].listener().local_addr().unwrap();

    let blob = passage_handler::http::encode_target_blob(&echo.to_string());
    let mut client = TcpStream::connect(entry).await.unwrap();
    // the request line aims at a dead address; the header overrides it
    client
        .write_all(
            format!(
                "CONNECT 192.0.2.1:9 HTTP/1.1\r\nHost: 192.0.2.1:9\r\nGost-Target: {blob}\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut head = [0u8; 12];
    client.read_exact(&mut head).await.unwrap();
    assert_eq!(&head, b"HTTP/1.1 200");

    shutdown.cancel();
}
