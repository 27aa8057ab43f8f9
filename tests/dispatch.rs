//! End-to-end dispatch scenarios through a live gateway.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use sidestep::gateway::session::{Session, SessionError};
use sidestep::gateway::GatewayContext;
use sidestep::relay::{self, RelayEnd, RelayOptions};
use sidestep::sniff::Protocol;
use sidestep::upstream::http_connect::HttpConnectProxy;
use sidestep::upstream::http_relay::HttpRelayProxy;
use sidestep::upstream::{BackendHealth, BackendId, ForwardOutcome, ProxyBackend};

use common::{
    client_hello, start_gateway, start_mock_connect_proxy, start_mock_origin,
    start_one_byte_origin, start_silent_origin,
};

/// Backend that always asks for a fallback, counting its invocations.
struct DeadEndBackend {
    id: BackendId,
    health: BackendHealth,
    protocol: Protocol,
    priority: i32,
    calls: Arc<AtomicU32>,
}

impl DeadEndBackend {
    fn new(protocol: Protocol, priority: i32) -> (Arc<Self>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let backend = Arc::new(Self {
            id: BackendId::new("dead-end"),
            health: BackendHealth::new(),
            protocol,
            priority,
            calls: calls.clone(),
        });
        (backend, calls)
    }
}

#[async_trait]
impl ProxyBackend for DeadEndBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "stub"
    }

    fn health(&self) -> &BackendHealth {
        &self.health
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn supports(&self, protocol: Protocol, _session: Option<&Session>) -> bool {
        protocol == self.protocol
    }

    async fn forward(
        &self,
        _session: &mut Session,
        _ctx: &GatewayContext,
    ) -> Result<ForwardOutcome, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ForwardOutcome::Fallback {
            reason: "dead end".into(),
            silent: false,
        })
    }
}

/// Backend that relays the session from a fixed origin address, replaying
/// the peeked bytes the way real tunnels do.
struct PinnedOriginBackend {
    id: BackendId,
    health: BackendHealth,
    origin: std::net::SocketAddr,
    priority: i32,
}

impl PinnedOriginBackend {
    fn new(name: &str, origin: std::net::SocketAddr, priority: i32) -> Arc<Self> {
        Arc::new(Self {
            id: BackendId::new(name),
            health: BackendHealth::new(),
            origin,
            priority,
        })
    }
}

#[async_trait]
impl ProxyBackend for PinnedOriginBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "stub"
    }

    fn health(&self) -> &BackendHealth {
        &self.health
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn supports(&self, _protocol: Protocol, _session: Option<&Session>) -> bool {
        true
    }

    async fn forward(
        &self,
        session: &mut Session,
        ctx: &GatewayContext,
    ) -> Result<ForwardOutcome, SessionError> {
        let mut upstream = TcpStream::connect(self.origin).await?;
        if !session.peeked_data.is_empty() && upstream.write_all(&session.peeked_data).await.is_err()
        {
            return Ok(ForwardOutcome::Fallback {
                reason: "send failed".into(),
                silent: false,
            });
        }
        let counter = ctx
            .ledger
            .opened(self.id.clone(), session.host.clone(), session.dst_ip);
        session.track_counter(counter.clone());
        match relay::forward(session, upstream, counter, RelayOptions::new(&ctx.timeouts)).await? {
            RelayEnd::Completed => Ok(ForwardOutcome::Completed),
            RelayEnd::NoPayload { .. } => Ok(ForwardOutcome::Fallback {
                reason: "no response".into(),
                silent: false,
            }),
        }
    }
}

/// Open a CONNECT tunnel through the gateway and assert the 200 greeting.
async fn open_tunnel(gateway: std::net::SocketAddr, target: String) -> TcpStream {
    let mut stream = TcpStream::connect(gateway).await.unwrap();
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut reply = [0u8; 19];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"HTTP/1.1 200 OK\r\n\r\n");
    stream
}

#[tokio::test]
async fn lan_traffic_short_circuits_to_direct() {
    let gateway = start_gateway(true).await;
    let (origin, _requests) = start_mock_origin("lan-ok").await;

    let mut tunnel = open_tunnel(gateway.addr, origin.to_string()).await;
    tunnel
        .write_all(b"GET / HTTP/1.1\r\nHost: lan.example\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tunnel.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).ends_with("lan-ok"));

    let counters = gateway.ctx.ledger.snapshot();
    assert_eq!(counters.len(), 1);
    assert_eq!(counters[0].backend.as_str(), "DIRECT");
    gateway.shutdown.trigger();
}

#[tokio::test]
async fn http_tunnel_goes_through_the_tcp_scrambler_first() {
    let gateway = start_gateway(false).await;
    let (origin, requests) = start_mock_origin("scrambled-ok").await;

    let mut tunnel = open_tunnel(gateway.addr, origin.to_string()).await;
    let request = b"GET /path HTTP/1.1\r\nHost: blocked.example\r\n\r\n";
    tunnel.write_all(request).await.unwrap();
    let mut response = Vec::new();
    tunnel.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).ends_with("scrambled-ok"));

    // Fragmented writes must still deliver the request byte-for-byte.
    assert_eq!(requests.lock().unwrap()[0], request);
    let counters = gateway.ctx.ledger.snapshot();
    assert_eq!(counters[0].backend.as_str(), "TCP_SCRAMBLER");
    gateway.shutdown.trigger();
}

#[tokio::test]
async fn plain_proxy_request_is_rewritten_to_origin_form() {
    let gateway = start_gateway(false).await;
    let (origin, requests) = start_mock_origin("rewritten-ok").await;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{}", gateway.addr)).unwrap())
        .build()
        .unwrap();
    let response = client
        .get(format!("http://{origin}/x"))
        .header("Proxy-Connection", "Keep-Alive")
        .send()
        .await
        .expect("gateway unreachable");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "rewritten-ok");

    let recorded = requests.lock().unwrap();
    let text = String::from_utf8_lossy(&recorded[0]);
    assert!(text.starts_with("GET /x HTTP/1.1\r\n"), "got: {text}");
    assert!(text.contains("Host: 127.0.0.1\r\n"));
    assert!(text.contains("Connection: close\r\n"));
    assert!(!text.to_ascii_lowercase().contains("proxy-connection"));
    gateway.shutdown.trigger();
}

#[tokio::test]
async fn pre_start_failure_falls_back_to_the_next_backend() {
    let gateway = start_gateway(false).await;
    gateway.ctx.registry.flags.set_direct_access_enabled(false);
    let (relay_server, relayed) = start_mock_origin("fallback-ok").await;

    let (dead_end, calls) = DeadEndBackend::new(Protocol::Http, -1);
    gateway.ctx.registry.add_backend(dead_end);
    gateway
        .ctx
        .registry
        .add_backend(Arc::new(HttpRelayProxy::new(
            relay_server.ip().to_string(),
            relay_server.port(),
            None,
            None,
            0,
        )));

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{}", gateway.addr)).unwrap())
        .build()
        .unwrap();
    let response = client
        .get("http://203.0.113.9:59999/x")
        .send()
        .await
        .expect("gateway unreachable");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "fallback-ok");

    assert_eq!(calls.load(Ordering::SeqCst), 1, "dead end tried exactly once");
    let text = String::from_utf8_lossy(&relayed.lock().unwrap()[0]).to_string();
    assert!(
        text.starts_with("GET http://203.0.113.9:59999/x HTTP/1.1\r\n"),
        "relay saw: {text}"
    );
    gateway.shutdown.trigger();
}

#[tokio::test]
async fn no_second_pick_after_the_first_byte_reached_the_client() {
    let gateway = start_gateway(false).await;
    gateway.ctx.registry.flags.set_direct_access_enabled(false);
    let origin = start_one_byte_origin().await;

    gateway
        .ctx
        .registry
        .add_backend(PinnedOriginBackend::new("one-byte", origin, -1));
    let (counting, calls) = DeadEndBackend::new(Protocol::Https, 0);
    gateway.ctx.registry.add_backend(counting);

    let mut tunnel = open_tunnel(gateway.addr, origin.to_string()).await;
    tunnel.write_all(&client_hello("x.example")).await.unwrap();
    let mut received = Vec::new();
    tunnel.read_to_end(&mut received).await.unwrap();

    assert_eq!(received, b"X");
    assert_eq!(
        calls.load(Ordering::SeqCst),
        0,
        "no fallback after a byte was delivered"
    );
    gateway.shutdown.trigger();
}

#[tokio::test]
async fn pre_start_silence_retries_on_the_next_backend() {
    let gateway = start_gateway(false).await;
    gateway.ctx.registry.flags.set_direct_access_enabled(false);
    let silent = start_silent_origin().await;
    let (origin, _) = start_mock_origin("eventually-ok").await;

    gateway
        .ctx
        .registry
        .add_backend(PinnedOriginBackend::new("silent", silent, -1));
    gateway
        .ctx
        .registry
        .add_backend(PinnedOriginBackend::new("good", origin, 0));

    let mut tunnel = open_tunnel(gateway.addr, origin.to_string()).await;
    tunnel
        .write_all(b"GET / HTTP/1.1\r\nHost: retry.example\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tunnel.read_to_end(&mut response).await.unwrap();
    assert!(
        String::from_utf8_lossy(&response).ends_with("eventually-ok"),
        "second backend should have carried the session"
    );
    gateway.shutdown.trigger();
}

#[tokio::test]
async fn wrong_answer_destination_is_sunk_and_stamped() {
    let gateway = start_gateway(false).await;
    assert_eq!(gateway.ctx.registry.dns_polluted_at(), 0);

    let mut tunnel = open_tunnel(gateway.addr, "93.46.8.89:443".to_string()).await;
    let mut rest = Vec::new();
    // NONE_PROXY closes without relaying anything.
    tunnel.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    assert!(gateway.ctx.registry.dns_polluted_at() > 0);
    gateway.shutdown.trigger();
}

#[tokio::test]
async fn https_rides_a_pool_connect_backend_when_direct_is_off() {
    let gateway = start_gateway(false).await;
    gateway.ctx.registry.flags.set_direct_access_enabled(false);
    let origin = start_one_byte_origin().await;
    let connect_proxy = start_mock_connect_proxy().await;

    gateway
        .ctx
        .registry
        .add_backend(Arc::new(HttpConnectProxy::new(
            connect_proxy.ip().to_string(),
            connect_proxy.port(),
            None,
            None,
            0,
        )));

    let mut tunnel = open_tunnel(gateway.addr, origin.to_string()).await;
    // TLS-shaped bytes with no SNI: the CONNECT target falls back to the
    // destination address.
    tunnel
        .write_all(&[0x16, 0x03, 0x01, 0x00, 0x03, 0x01, 0x02, 0x03])
        .await
        .unwrap();
    let mut received = Vec::new();
    tunnel.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"X");
    gateway.shutdown.trigger();
}

#[tokio::test]
async fn resolver_failure_closes_silently() {
    let gateway = start_gateway(false).await;
    let mut stream = TcpStream::connect(gateway.addr).await.unwrap();
    stream
        .write_all(b"CONNECT no-such-host.invalid:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(30), stream.read_to_end(&mut reply))
        .await
        .expect("gateway should close, not hang")
        .unwrap();
    assert!(reply.is_empty(), "no error page on resolution failure");
    gateway.shutdown.trigger();
}
