//! Direct-connection strategies.
//!
//! DIRECT goes straight to the destination. HTTPS_TRY is DIRECT for TLS
//! traffic with a destination black list fed by delayed penalties.
//! NONE_PROXY is the sink used when the destination itself is evidence of
//! DNS tampering.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;

use crate::gateway::session::{Session, SessionError};
use crate::gateway::GatewayContext;
use crate::relay::{self, RelayEnd, RelayOptions};
use crate::sniff::Protocol;
use crate::upstream::backend::{BackendHealth, BackendId, ForwardOutcome, ProxyBackend};
use crate::upstream::open_upstream;

use tokio::io::AsyncWriteExt;

/// Plain TCP to the destination.
pub struct DirectProxy {
    id: BackendId,
    health: BackendHealth,
}

impl DirectProxy {
    pub fn new() -> Self {
        Self {
            id: BackendId::new("DIRECT"),
            health: BackendHealth::new(),
        }
    }
}

impl Default for DirectProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyBackend for DirectProxy {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "direct"
    }

    fn health(&self) -> &BackendHealth {
        &self.health
    }

    fn is_direct(&self) -> bool {
        true
    }

    fn supports(&self, _protocol: Protocol, _session: Option<&Session>) -> bool {
        true
    }

    async fn forward(
        &self,
        session: &mut Session,
        ctx: &GatewayContext,
    ) -> Result<ForwardOutcome, SessionError> {
        forward_direct(self.id(), session, ctx, None).await
    }
}

/// DIRECT for TLS traffic, with a destination black list: a destination
/// that produced no payload gets black-listed once some other strategy
/// proves the session was viable.
pub struct HttpsTryProxy {
    id: BackendId,
    health: BackendHealth,
    pub dst_black_list: Arc<DashSet<(std::net::IpAddr, u16)>>,
}

impl HttpsTryProxy {
    pub fn new() -> Self {
        Self {
            id: BackendId::new("HTTPS_TRY"),
            health: BackendHealth::new(),
            dst_black_list: Arc::new(DashSet::new()),
        }
    }

    pub fn clear_lists(&self) {
        self.dst_black_list.clear();
    }
}

impl Default for HttpsTryProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyBackend for HttpsTryProxy {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "https-try"
    }

    fn health(&self) -> &BackendHealth {
        &self.health
    }

    fn is_direct(&self) -> bool {
        true
    }

    fn supports(&self, protocol: Protocol, _session: Option<&Session>) -> bool {
        protocol == Protocol::Https
    }

    async fn forward(
        &self,
        session: &mut Session,
        ctx: &GatewayContext,
    ) -> Result<ForwardOutcome, SessionError> {
        let dst = (session.dst_ip, session.dst_port);
        if self.dst_black_list.contains(&dst) {
            return Ok(ForwardOutcome::Fallback {
                reason: "destination black listed".into(),
                silent: true,
            });
        }
        let black_list = self.dst_black_list.clone();
        let penalty: crate::gateway::session::Penalty = Box::new(move || {
            black_list.insert(dst);
        });
        forward_direct(self.id(), session, ctx, Some(penalty)).await
    }
}

/// Sink used when DNS pollution is detected: accept nothing, relay nothing.
pub struct NoneProxy {
    id: BackendId,
    health: BackendHealth,
}

impl NoneProxy {
    pub fn new() -> Self {
        Self {
            id: BackendId::new("NONE"),
            health: BackendHealth::new(),
        }
    }
}

impl Default for NoneProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyBackend for NoneProxy {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "none"
    }

    fn health(&self) -> &BackendHealth {
        &self.health
    }

    fn supports(&self, _protocol: Protocol, _session: Option<&Session>) -> bool {
        true
    }

    async fn forward(
        &self,
        session: &mut Session,
        _ctx: &GatewayContext,
    ) -> Result<ForwardOutcome, SessionError> {
        let _ = session.downstream.shutdown().await;
        Ok(ForwardOutcome::Completed)
    }
}

/// Shared direct-connect body: open, replay the peeked bytes, relay.
async fn forward_direct(
    id: &BackendId,
    session: &mut Session,
    ctx: &GatewayContext,
    delayed_penalty: Option<crate::gateway::session::Penalty>,
) -> Result<ForwardOutcome, SessionError> {
    let (dst_ip, dst_port) = (session.dst_ip, session.dst_port);
    let (mut upstream, counter) = match open_upstream(
        session,
        ctx,
        id,
        dst_ip,
        dst_port,
        ctx.timeouts.connect(),
    )
    .await
    {
        Ok(pair) => pair,
        Err(e) => {
            return Ok(ForwardOutcome::Fallback {
                reason: format!("direct connect failed: {e}"),
                silent: false,
            })
        }
    };

    if !session.peeked_data.is_empty() {
        if let Err(e) = upstream.write_all(&session.peeked_data).await {
            return Ok(ForwardOutcome::Fallback {
                reason: format!("direct send failed: {e}"),
                silent: false,
            });
        }
    }

    let mut opts = RelayOptions::new(&ctx.timeouts);
    opts.delayed_penalty = delayed_penalty;
    match relay::forward(session, upstream, counter, opts).await? {
        RelayEnd::Completed => Ok(ForwardOutcome::Completed),
        RelayEnd::NoPayload { delayed_penalty } => {
            if let Some(penalty) = delayed_penalty {
                session.delayed_penalties.push(penalty);
            }
            Ok(ForwardOutcome::Fallback {
                reason: "forward received no response".into(),
                silent: false,
            })
        }
    }
}
