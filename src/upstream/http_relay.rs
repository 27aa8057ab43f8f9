//! Plaintext HTTP via a remote relay server.
//!
//! The front door hands us an origin-form request; the relay expects the
//! absolute form, so the request line is rewritten and the credentials (if
//! any) ride along as `Proxy-Authorization`.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::AsyncWriteExt;

use crate::gateway::session::{Session, SessionError};
use crate::gateway::GatewayContext;
use crate::net::HostResolver;
use crate::relay::{self, RelayEnd, RelayOptions};
use crate::sniff::Protocol;
use crate::upstream::backend::{BackendHealth, BackendId, ForwardOutcome, ProxyBackend};
use crate::upstream::{open_upstream, probe_latency};

pub struct HttpRelayProxy {
    id: BackendId,
    health: BackendHealth,
    priority: i32,
    pub host: String,
    pub port: u16,
    username: Option<String>,
    password: Option<String>,
    resolved_ip: ArcSwapOption<IpAddr>,
}

impl HttpRelayProxy {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        priority: i32,
    ) -> Self {
        let host = host.into();
        Self {
            id: BackendId::new(format!("http-relay/{host}:{port}")),
            health: BackendHealth::new(),
            priority,
            host,
            port,
            username,
            password,
            resolved_ip: ArcSwapOption::empty(),
        }
    }

    fn proxy_authorization(&self) -> Option<String> {
        let user = self.username.as_deref()?;
        let pass = self.password.as_deref().unwrap_or("");
        Some(BASE64.encode(format!("{user}:{pass}")))
    }

    async fn endpoint_ip(&self, resolver: &HostResolver) -> Option<IpAddr> {
        if let Some(ip) = self.resolved_ip.load_full() {
            return Some(*ip);
        }
        let ip = resolver.resolve(&self.host).await?;
        self.resolved_ip.store(Some(Arc::new(ip)));
        Some(ip)
    }
}

#[async_trait]
impl ProxyBackend for HttpRelayProxy {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "http-relay"
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
        protocol == Protocol::Http
    }

    async fn forward(
        &self,
        session: &mut Session,
        ctx: &GatewayContext,
    ) -> Result<ForwardOutcome, SessionError> {
        let Some(ip) = self.endpoint_ip(&ctx.resolver).await else {
            self.health.record_failure();
            return Ok(ForwardOutcome::Fallback {
                reason: format!("relay host {} unresolved", self.host),
                silent: false,
            });
        };

        let request = match absolutize_request(
            &session.peeked_data,
            &session.host,
            session.dst_port,
            self.proxy_authorization().as_deref(),
        ) {
            Some(req) => req,
            None => return Ok(ForwardOutcome::NotHttp),
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
                    reason: format!("relay connect failed: {e}"),
                    silent: false,
                });
            }
        };

        if let Err(e) = upstream.write_all(&request).await {
            self.health.record_failure();
            return Ok(ForwardOutcome::Fallback {
                reason: format!("relay send failed: {e}"),
                silent: false,
            });
        }

        match relay::forward(session, upstream, counter, RelayOptions::new(&ctx.timeouts)).await? {
            RelayEnd::Completed => {
                self.health.record_success();
                Ok(ForwardOutcome::Completed)
            }
            RelayEnd::NoPayload { .. } => {
                self.health.record_failure();
                Ok(ForwardOutcome::Fallback {
                    reason: "relay received no response".into(),
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

/// Rewrite an origin-form request to the absolute form the relay expects,
/// inserting `Proxy-Authorization` when credentials are configured.
fn absolutize_request(
    peeked: &[u8],
    host: &str,
    dst_port: u16,
    basic_auth: Option<&str>,
) -> Option<Vec<u8>> {
    if host.is_empty() {
        return None;
    }
    let line_end = peeked.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&peeked[..line_end]).ok()?;
    let mut parts = line.splitn(3, ' ');
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if !target.starts_with('/') || !version.starts_with("HTTP/") {
        return None;
    }

    let authority = if dst_port == 80 {
        host.to_string()
    } else {
        format!("{host}:{dst_port}")
    };
    let mut out = Vec::with_capacity(peeked.len() + 64);
    out.extend_from_slice(format!("{method} http://{authority}{target} {version}\r\n").as_bytes());
    if let Some(auth) = basic_auth {
        out.extend_from_slice(format!("Proxy-Authorization: Basic {auth}\r\n").as_bytes());
    }
    out.extend_from_slice(&peeked[line_end + 2..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_to_absolute_form() {
        let peeked = b"GET /x HTTP/1.1\r\nHost: example.org\r\nConnection: close\r\n\r\n";
        let out = absolutize_request(peeked, "example.org", 80, None).unwrap();
        assert_eq!(
            out,
            b"GET http://example.org/x HTTP/1.1\r\nHost: example.org\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn keeps_nonstandard_port_and_adds_auth() {
        let peeked = b"GET /x HTTP/1.1\r\nHost: example.org:8080\r\n\r\n";
        let out = absolutize_request(peeked, "example.org", 8080, Some("dXNlcjpwdw==")).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("GET http://example.org:8080/x HTTP/1.1\r\n"));
        assert!(text.contains("Proxy-Authorization: Basic dXNlcjpwdw==\r\n"));
    }

    #[test]
    fn rejects_non_http_preambles() {
        assert!(absolutize_request(b"\x16\x03\x01junk\r\n\r\n", "h", 80, None).is_none());
        assert!(absolutize_request(b"GET /x HTTP/1.1\r\n\r\n", "", 80, None).is_none());
    }
}
