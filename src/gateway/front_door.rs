//! Forward-proxy front door.
//!
//! # Responsibilities
//! - Accept TCP connections, bounded by a session-count semaphore
//! - Read the HTTP preamble
//! - `CONNECT host:port` → answer 200 and tunnel raw bytes
//! - `METHOD absolute-URI` → rewrite to origin-form and relay
//! - Resolve destination hosts through the process-wide cache
//!
//! Malformed preambles and resolution failures close silently; the client
//! is in no position to use an error page.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ListenerConfig;
use crate::gateway::dispatcher;
use crate::gateway::session::Session;
use crate::gateway::GatewayContext;

const MAX_PREAMBLE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrontDoorError {
    #[error("failed to bind: {0}")]
    Bind(#[source] std::io::Error),
    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),
}

pub struct FrontDoor {
    listener: TcpListener,
    /// Each session holds a permit for its lifetime; when the limit is
    /// reached the accept loop waits instead of accepting.
    session_limit: Arc<Semaphore>,
    ctx: Arc<GatewayContext>,
}

impl FrontDoor {
    pub async fn bind(
        config: &ListenerConfig,
        ctx: Arc<GatewayContext>,
    ) -> Result<Self, FrontDoorError> {
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            FrontDoorError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
        let listener = TcpListener::bind(addr).await.map_err(FrontDoorError::Bind)?;
        let local_addr = listener.local_addr().map_err(FrontDoorError::Bind)?;

        tracing::info!(
            address = %local_addr,
            max_connections = config.max_connections,
            "front door bound"
        );

        Ok(Self {
            listener,
            session_limit: Arc::new(Semaphore::new(config.max_connections)),
            ctx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Wait for a session slot, then for a connection. Dropping the future
    /// (shutdown) releases any slot it was holding.
    async fn accept(&self) -> Result<(TcpStream, SocketAddr, OwnedSemaphorePermit), FrontDoorError> {
        let permit = self
            .session_limit
            .clone()
            .acquire_owned()
            .await
            .expect("session semaphore closed unexpectedly");
        let (stream, peer) = self.listener.accept().await.map_err(FrontDoorError::Accept)?;
        Ok((stream, peer, permit))
    }

    /// Accept loop; one task per connection.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let ctx = self.ctx.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            handle_accept(stream, peer, ctx).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("front door stopped");
                    break;
                }
            }
        }
    }
}

async fn handle_accept(mut stream: TcpStream, peer: SocketAddr, ctx: Arc<GatewayContext>) {
    let Some((head, residual)) = read_preamble(&mut stream).await else {
        return;
    };
    let Some(request) = parse_request(&head) else {
        return;
    };
    let us_ip_only = ctx.registry.flags.force_us_ip();

    if request.method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(&request.target, 443);
        let Some(ip) = ctx.resolver.resolve(&host).await else {
            return;
        };
        if stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.is_err() {
            return;
        }
        let session = Session::new(stream, peer, ip, port, us_ip_only);
        dispatcher::handle_session(session, ctx).await;
    } else {
        let Some((host, port)) = host_from_absolute_uri(&request.target) else {
            return;
        };
        let Some(ip) = ctx.resolver.resolve(&host).await else {
            return;
        };
        let Some(rewritten) = rewrite_to_origin_form(&request, &host, &residual) else {
            return;
        };
        let mut session = Session::new(stream, peer, ip, port, us_ip_only);
        session.peeked_data = Bytes::from(rewritten);
        dispatcher::handle_session(session, ctx).await;
    }
}

/// Read until the first blank line; returns (head incl. the blank line,
/// residual body bytes already received).
async fn read_preamble(stream: &mut TcpStream) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = find_double_newline(&buf) {
            let residual = buf.split_off(pos + 4);
            return Some((buf, residual));
        }
        if buf.len() > MAX_PREAMBLE {
            return None;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[derive(Debug)]
struct ParsedRequest {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
}

fn parse_request(head: &[u8]) -> Option<ParsedRequest> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Some(ParsedRequest {
        method,
        target,
        headers,
    })
}

/// `host[:port]` with a default port.
fn split_host_port(target: &str, default_port: u16) -> (String, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (target.to_string(), default_port),
        },
        None => (target.to_string(), default_port),
    }
}

/// Extract `(host, port)` from an absolute URI; anything else is a
/// malformed proxy request.
fn host_from_absolute_uri(target: &str) -> Option<(String, u16)> {
    let url = url::Url::parse(target).ok()?;
    let host = url.host_str()?.to_string();
    let port = url.port().unwrap_or(80);
    Some((host, port))
}

/// Rewrite an absolute-URI proxy request to the origin form the destination
/// expects: strip scheme+authority from the target, drop Proxy-Connection,
/// pin Host, force Connection: close. Header order is preserved.
fn rewrite_to_origin_form(
    request: &ParsedRequest,
    host: &str,
    residual: &[u8],
) -> Option<Vec<u8>> {
    let url = url::Url::parse(&request.target).ok()?;
    let mut origin_target = url.path().to_string();
    if let Some(query) = url.query() {
        origin_target.push('?');
        origin_target.push_str(query);
    }

    let mut out = Vec::with_capacity(256 + residual.len());
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", request.method, origin_target).as_bytes());

    let mut connection_written = false;
    let mut host_written = false;
    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("Proxy-Connection") {
            continue;
        }
        if name.eq_ignore_ascii_case("Host") {
            out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
            host_written = true;
            continue;
        }
        if name.eq_ignore_ascii_case("Connection") {
            out.extend_from_slice(b"Connection: close\r\n");
            connection_written = true;
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !host_written {
        out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    }
    if !connection_written {
        out.extend_from_slice(b"Connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(residual);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_preambles() {
        let head = b"CONNECT example.org:8443 HTTP/1.1\r\nHost: example.org:8443\r\n\r\n";
        let req = parse_request(head).unwrap();
        assert_eq!(req.method, "CONNECT");
        assert_eq!(split_host_port(&req.target, 443), ("example.org".into(), 8443));
        assert_eq!(split_host_port("example.org", 443), ("example.org".into(), 443));
    }

    #[test]
    fn rejects_malformed_request_lines() {
        assert!(parse_request(b"GET\r\n\r\n").is_none());
        assert!(parse_request(b"GET / FTP/1.0\r\n\r\n").is_none());
        assert!(parse_request(b"\xff\xfe\r\n\r\n").is_none());
    }

    #[test]
    fn origin_form_rewrite_round_trip() {
        let head = b"GET http://example.org/x HTTP/1.1\r\nHost: example.org\r\nProxy-Connection: Keep-Alive\r\n\r\n";
        let req = parse_request(head).unwrap();
        let (host, port) = host_from_absolute_uri(&req.target).unwrap();
        assert_eq!(host, "example.org");
        assert_eq!(port, 80);
        let rewritten = rewrite_to_origin_form(&req, &host, b"").unwrap();
        assert_eq!(
            rewritten,
            b"GET /x HTTP/1.1\r\nHost: example.org\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn rewrite_preserves_query_body_and_extra_headers() {
        let head = b"POST http://api.example:8080/v1/items?full=1 HTTP/1.1\r\nHost: api.example:8080\r\nContent-Length: 4\r\nConnection: keep-alive\r\n\r\n";
        let req = parse_request(head).unwrap();
        let (host, port) = host_from_absolute_uri(&req.target).unwrap();
        assert_eq!(port, 8080);
        let rewritten = rewrite_to_origin_form(&req, &host, b"data").unwrap();
        let text = String::from_utf8_lossy(&rewritten);
        assert!(text.starts_with("POST /v1/items?full=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: api.example\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("keep-alive"));
        assert!(text.ends_with("\r\n\r\ndata"));
    }

    #[test]
    fn relative_targets_are_not_proxy_requests() {
        assert!(host_from_absolute_uri("/just/a/path").is_none());
        assert!(host_from_absolute_uri("*").is_none());
    }
}
