//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use sidestep::config::{GatewayConfig, TimeoutConfig};
use sidestep::gateway::GatewayContext;
use sidestep::net::HostResolver;
use sidestep::observability::stat::TrafficLedger;
use sidestep::policy::us_ip::UsIpCache;
use sidestep::policy::HostPolicies;
use sidestep::registry::{GlobalFlags, ProxyRegistry};
use sidestep::{FrontDoor, Shutdown};

/// A gateway running in-process on an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub ctx: Arc<GatewayContext>,
    pub shutdown: Shutdown,
}

/// Start a gateway. With `loopback_is_lan` false the default LAN ranges are
/// cleared so loopback test traffic exercises the full pick loop instead of
/// the LAN short-circuit.
pub async fn start_gateway(loopback_is_lan: bool) -> TestGateway {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.timeouts = TimeoutConfig {
        connect_secs: 2,
        idle_secs: 5,
        sniff_wait_ms: 100,
    };

    let ledger = Arc::new(TrafficLedger::new());
    let resolver = Arc::new(HostResolver::new());
    let mut policies = HostPolicies::from_config(&config.policy, UsIpCache::in_memory());
    if !loopback_is_lan {
        policies = policies.with_lan_ranges(Vec::new());
    }
    let policies = Arc::new(policies);
    let registry = Arc::new(ProxyRegistry::new(
        GlobalFlags::new(&config.flags, &config.public_servers),
        ledger.clone(),
        resolver.clone(),
    ));

    let ctx = Arc::new(GatewayContext {
        registry,
        policies,
        resolver,
        ledger,
        timeouts: config.timeouts.clone(),
    });

    let shutdown = Shutdown::new();
    let front_door = FrontDoor::bind(&config.listener, ctx.clone())
        .await
        .expect("bind test gateway");
    let addr = front_door.local_addr().unwrap();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        front_door.run(rx).await;
    });

    TestGateway {
        addr,
        ctx,
        shutdown,
    }
}

/// Start a mock origin that answers every connection with one fixed HTTP
/// response and records the raw request bytes it saw.
pub async fn start_mock_origin(body: &'static str) -> (SocketAddr, Arc<Mutex<Vec<Vec<u8>>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let recorded = recorded.clone();
                    tokio::spawn(async move {
                        let mut request = Vec::new();
                        let mut buf = [0u8; 4096];
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    request.extend_from_slice(&buf[..n]);
                                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                        break;
                                    }
                                }
                            }
                        }
                        recorded.lock().unwrap().push(request);
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    (addr, requests)
}

/// Start an origin that sends a single byte and then drops the connection.
#[allow(dead_code)]
pub async fn start_one_byte_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let _ = socket.write_all(b"X").await;
                        // Give the tunnel a moment to deliver before the
                        // close races the payload.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        drop(socket);
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// Start an origin that accepts and immediately closes without a byte.
#[allow(dead_code)]
pub async fn start_silent_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => drop(socket),
                Err(_) => break,
            }
        }
    });
    addr
}

/// Start a mock HTTP CONNECT proxy that tunnels to whatever target the
/// client names.
#[allow(dead_code)]
pub async fn start_mock_connect_proxy() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut preamble = Vec::new();
                        let mut buf = [0u8; 1024];
                        while !preamble.windows(4).any(|w| w == b"\r\n\r\n") {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => preamble.extend_from_slice(&buf[..n]),
                            }
                        }
                        let text = String::from_utf8_lossy(&preamble);
                        let target = match text.split_whitespace().nth(1) {
                            Some(t) => t.to_string(),
                            None => return,
                        };
                        let Ok(mut upstream) = TcpStream::connect(target.as_str()).await else {
                            let _ = socket
                                .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                                .await;
                            return;
                        };
                        if socket.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.is_err() {
                            return;
                        }
                        let _ = tokio::io::copy_bidirectional(&mut socket, &mut upstream).await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// A TLS 1.0 ClientHello-shaped record carrying an SNI for `domain`.
#[allow(dead_code)]
pub fn client_hello(domain: &str) -> Vec<u8> {
    let mut body = vec![0x01, 0x00, 0x00];
    body.push(0x00);
    body.push(0x00);
    body.push(domain.len() as u8);
    body.extend_from_slice(domain.as_bytes());
    body.extend_from_slice(&[0x00, 0x17, 0x00, 0x00]);
    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(body.len() as u16).to_be_bytes());
    record.extend_from_slice(&body);
    record
}
