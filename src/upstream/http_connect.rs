//! Tunneling via a remote HTTP CONNECT proxy.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::gateway::session::{Session, SessionError};
use crate::gateway::GatewayContext;
use crate::net::HostResolver;
use crate::relay::{self, RelayEnd, RelayOptions};
use crate::sniff::Protocol;
use crate::upstream::backend::{BackendHealth, BackendId, ForwardOutcome, ProxyBackend};
use crate::upstream::{open_upstream, probe_latency};

pub struct HttpConnectProxy {
    id: BackendId,
    health: BackendHealth,
    priority: i32,
    pub host: String,
    pub port: u16,
    username: Option<String>,
    password: Option<String>,
    resolved_ip: ArcSwapOption<IpAddr>,
}

impl HttpConnectProxy {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        priority: i32,
    ) -> Self {
        let host = host.into();
        Self {
            id: BackendId::new(format!("http-connect/{host}:{port}")),
            health: BackendHealth::new(),
            priority,
            host,
            port,
            username,
            password,
            resolved_ip: ArcSwapOption::empty(),
        }
    }

    async fn endpoint_ip(&self, resolver: &HostResolver) -> Option<IpAddr> {
        if let Some(ip) = self.resolved_ip.load_full() {
            return Some(*ip);
        }
        let ip = resolver.resolve(&self.host).await?;
        self.resolved_ip.store(Some(Arc::new(ip)));
        Some(ip)
    }

    /// Build the CONNECT preamble for a session.
    fn connect_request(&self, session: &Session) -> Vec<u8> {
        let target = if session.host.is_empty() {
            format!("{}:{}", session.dst_ip, session.dst_port)
        } else {
            format!("{}:{}", session.host, session.dst_port)
        };
        let mut req = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(user) = &self.username {
            let pass = self.password.as_deref().unwrap_or("");
            let token = BASE64.encode(format!("{user}:{pass}"));
            req.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
        }
        req.push_str("\r\n");
        req.into_bytes()
    }
}

/// Read the proxy's reply up to the blank line and demand a 2xx status.
async fn read_connect_reply(upstream: &mut TcpStream) -> std::io::Result<bool> {
    let mut reply = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !reply.ends_with(b"\r\n\r\n") {
        if reply.len() > 4096 {
            return Ok(false);
        }
        let n = upstream.read(&mut byte).await?;
        if n == 0 {
            return Ok(false);
        }
        reply.push(byte[0]);
    }
    Ok(connect_reply_ok(&reply))
}

fn connect_reply_ok(reply: &[u8]) -> bool {
    let line_end = reply
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(reply.len());
    let line = String::from_utf8_lossy(&reply[..line_end]);
    let mut parts = line.split_whitespace();
    matches!(
        (parts.next(), parts.next()),
        (Some(version), Some(status))
            if version.starts_with("HTTP/") && status.starts_with('2')
    )
}

#[async_trait]
impl ProxyBackend for HttpConnectProxy {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "http-connect"
    }

    fn health(&self) -> &BackendHealth {
        &self.health
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn proxy_ip(&self) -> Option<IpAddr> {
        self.resolved_ip.load_full().map(|ip| *ip)
    }

    fn supports(&self, protocol: Protocol, _session: Option<&Session>) -> bool {
        matches!(protocol, Protocol::Https | Protocol::Unknown)
    }

    async fn forward(
        &self,
        session: &mut Session,
        ctx: &GatewayContext,
    ) -> Result<ForwardOutcome, SessionError> {
        let Some(ip) = self.endpoint_ip(&ctx.resolver).await else {
            self.health.record_failure();
            return Ok(ForwardOutcome::Fallback {
                reason: format!("proxy host {} unresolved", self.host),
                silent: false,
            });
        };

        let (mut upstream, counter) = match open_upstream(
            session,
            ctx,
            self.id(),
            ip,
            self.port,
            ctx.timeouts.connect(),
        )
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                self.health.record_failure();
                return Ok(ForwardOutcome::Fallback {
                    reason: format!("proxy connect failed: {e}"),
                    silent: false,
                });
            }
        };

        let request = self.connect_request(session);
        let handshake = async {
            upstream.write_all(&request).await?;
            read_connect_reply(&mut upstream).await
        };
        let accepted = match tokio::time::timeout(ctx.timeouts.connect(), handshake).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                self.health.record_failure();
                return Ok(ForwardOutcome::Fallback {
                    reason: format!("CONNECT handshake failed: {e}"),
                    silent: false,
                });
            }
            Err(_) => {
                self.health.record_failure();
                return Ok(ForwardOutcome::Fallback {
                    reason: "CONNECT handshake timed out".into(),
                    silent: false,
                });
            }
        };
        if !accepted {
            self.health.record_failure();
            return Ok(ForwardOutcome::Fallback {
                reason: "CONNECT refused by proxy".into(),
                silent: false,
            });
        }

        if !session.peeked_data.is_empty() {
            if let Err(e) = upstream.write_all(&session.peeked_data).await {
                self.health.record_failure();
                return Ok(ForwardOutcome::Fallback {
                    reason: format!("tunnel send failed: {e}"),
                    silent: false,
                });
            }
        }

        match relay::forward(session, upstream, counter, RelayOptions::new(&ctx.timeouts)).await? {
            RelayEnd::Completed => {
                self.health.record_success();
                Ok(ForwardOutcome::Completed)
            }
            RelayEnd::NoPayload { .. } => {
                self.health.record_failure();
                Ok(ForwardOutcome::Fallback {
                    reason: "tunnel received no response".into(),
                    silent: false,
                })
            }
        }
    }

    async fn refresh_instance(&self, resolver: &HostResolver) -> bool {
        let Some(ip) = self.endpoint_ip(resolver).await else {
            self.set_died(true);
            return false;
        };
        match probe_latency(ip, self.port).await {
            Some(ms) => {
                self.health.record_latency(ms);
                self.set_died(false);
                true
            }
            None => {
                self.set_died(true);
                false
            }
        }
    }
}
