//! Directory-loaded backends.
//!
//! A dynamic backend knows only its DNS record name, its type tag and its
//! priority. Refresh resolves the record (a TXT payload of the form
//! `host:port[:username[:password]]`), builds the concrete delegate for the
//! type tag and probes it. Until that succeeds the entry is died.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;

use crate::gateway::session::{Session, SessionError};
use crate::gateway::GatewayContext;
use crate::net::HostResolver;
use crate::registry::directory::query_txt;
use crate::sniff::Protocol;
use crate::upstream::backend::{BackendHealth, BackendId, ForwardOutcome, ProxyBackend};
use crate::upstream::http_connect::HttpConnectProxy;
use crate::upstream::http_relay::HttpRelayProxy;

/// Endpoint parsed from a directory TXT payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEndpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl DirectoryEndpoint {
    pub fn parse(payload: &str) -> Option<Self> {
        let mut parts = payload.trim().split(':');
        let host = parts.next().filter(|h| !h.is_empty())?.to_string();
        let port = parts.next()?.parse().ok()?;
        let username = parts.next().map(str::to_string);
        let password = parts.next().map(str::to_string);
        Some(Self {
            host,
            port,
            username,
            password,
        })
    }
}

/// Build the concrete backend for a known type tag. Tags whose wire
/// implementations live outside this crate yield `None`.
pub fn build_delegate(
    tag: &str,
    endpoint: DirectoryEndpoint,
    priority: i32,
) -> Option<Box<dyn ProxyBackend>> {
    match tag {
        "http-relay" => Some(Box::new(HttpRelayProxy::new(
            endpoint.host,
            endpoint.port,
            endpoint.username,
            endpoint.password,
            priority,
        ))),
        "http-connect" => Some(Box::new(HttpConnectProxy::new(
            endpoint.host,
            endpoint.port,
            endpoint.username,
            endpoint.password,
            priority,
        ))),
        _ => None,
    }
}

/// Type tags the directory may announce. Tags beyond the built-in family
/// belong to external backend implementations.
pub const KNOWN_TYPE_TAGS: [&str; 7] = [
    "http-relay",
    "http-connect",
    "goagent",
    "ss",
    "ssh",
    "spdy-relay",
    "spdy-connect",
];

pub struct DynamicProxy {
    id: BackendId,
    health: BackendHealth,
    pub dns_record: String,
    pub delegate_tag: String,
    priority: i32,
    /// Read on every pick and forward, written once per resolution; the
    /// boxed indirection keeps the pointer thin for the atomic swap.
    delegate: ArcSwapOption<Box<dyn ProxyBackend>>,
}

impl DynamicProxy {
    pub fn new(dns_record: impl Into<String>, delegate_tag: impl Into<String>, priority: i32) -> Self {
        let dns_record = dns_record.into();
        Self {
            id: BackendId::new(format!("dynamic/{dns_record}")),
            health: BackendHealth::new(),
            dns_record,
            delegate_tag: delegate_tag.into(),
            priority,
            delegate: ArcSwapOption::empty(),
        }
    }

    fn delegate(&self) -> Option<Arc<Box<dyn ProxyBackend>>> {
        self.delegate.load_full()
    }
}

#[async_trait]
impl ProxyBackend for DynamicProxy {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "dynamic"
    }

    fn health(&self) -> &BackendHealth {
        &self.health
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn died(&self) -> bool {
        match self.delegate() {
            Some(delegate) => self.health().died() || delegate.died(),
            None => true,
        }
    }

    fn proxy_ip(&self) -> Option<IpAddr> {
        self.delegate()?.proxy_ip()
    }

    fn supports(&self, protocol: Protocol, session: Option<&Session>) -> bool {
        match self.delegate() {
            Some(delegate) => delegate.supports(protocol, session),
            None => false,
        }
    }

    async fn forward(
        &self,
        session: &mut Session,
        ctx: &GatewayContext,
    ) -> Result<ForwardOutcome, SessionError> {
        match self.delegate() {
            Some(delegate) => delegate.forward(session, ctx).await,
            None => Ok(ForwardOutcome::Fallback {
                reason: "directory entry not resolved yet".into(),
                silent: true,
            }),
        }
    }

    async fn refresh_instance(&self, resolver: &HostResolver) -> bool {
        let payloads = match query_txt(&self.dns_record).await {
            Ok(payloads) => payloads,
            Err(e) => {
                tracing::warn!(record = %self.dns_record, error = %e, "directory record lookup failed");
                self.set_died(true);
                return false;
            }
        };
        let Some(endpoint) = payloads.iter().find_map(|p| DirectoryEndpoint::parse(p)) else {
            tracing::warn!(record = %self.dns_record, "directory record carries no endpoint");
            self.set_died(true);
            return false;
        };
        let Some(delegate) = build_delegate(&self.delegate_tag, endpoint, self.priority) else {
            tracing::info!(
                record = %self.dns_record,
                tag = %self.delegate_tag,
                "backend type not built in, leaving entry dormant"
            );
            self.set_died(true);
            return true;
        };
        let healthy = delegate.refresh_instance(resolver).await;
        self.delegate.store(Some(Arc::new(delegate)));
        self.set_died(!healthy);
        healthy
    }
}
