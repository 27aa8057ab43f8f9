//! Plaintext-HTTP direct probes and their scramble variants.
//!
//! HTTP_TRY is DIRECT for plaintext HTTP with per-host black and slow
//! lists. TCP_SCRAMBLER and GOOGLE_SCRAMBLER reuse the same machinery but
//! perturb the upstream write pattern (the request is fragmented across
//! small segments) to upset DPI reassembly. GOOGLE_SCRAMBLER is only ever
//! selected for blocked Google hosts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::gateway::session::{Penalty, Session, SessionError};
use crate::gateway::GatewayContext;
use crate::relay::{self, RelayEnd, RelayOptions};
use crate::sniff::Protocol;
use crate::upstream::backend::{BackendHealth, BackendId, ForwardOutcome, ProxyBackend};
use crate::upstream::open_upstream;

/// First response slower than this marks the host as slow via direct.
const SLOW_THRESHOLD: Duration = Duration::from_secs(5);
/// Size of the leading fragment the scramble variants split off.
const SCRAMBLE_FRAGMENT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrambleVariant {
    /// Send the request as the client wrote it.
    Plain,
    /// Fragment the request across small TCP segments.
    Fragmented,
}

pub struct HttpTryProxy {
    id: BackendId,
    health: BackendHealth,
    variant: ScrambleVariant,
    pub host_black_list: Arc<DashSet<String>>,
    pub host_slow_list: Arc<DashSet<String>>,
    pub host_slow_detection_enabled: AtomicBool,
}

impl HttpTryProxy {
    pub fn new(id: &str, variant: ScrambleVariant) -> Self {
        Self {
            id: BackendId::new(id),
            health: BackendHealth::new(),
            variant,
            host_black_list: Arc::new(DashSet::new()),
            host_slow_list: Arc::new(DashSet::new()),
            host_slow_detection_enabled: AtomicBool::new(true),
        }
    }

    pub fn http_try() -> Self {
        Self::new("HTTP_TRY", ScrambleVariant::Plain)
    }

    pub fn tcp_scrambler() -> Self {
        Self::new("TCP_SCRAMBLER", ScrambleVariant::Fragmented)
    }

    pub fn google_scrambler() -> Self {
        Self::new("GOOGLE_SCRAMBLER", ScrambleVariant::Fragmented)
    }

    pub fn slow_detection_enabled(&self) -> bool {
        self.host_slow_detection_enabled.load(Ordering::Acquire)
    }

    /// Latch slow detection off for the rest of the process.
    pub fn disable_slow_detection(&self) {
        self.host_slow_detection_enabled
            .store(false, Ordering::Release);
        self.host_slow_list.clear();
    }

    pub fn clear_lists(&self) {
        self.host_black_list.clear();
        self.host_slow_list.clear();
        self.host_slow_detection_enabled
            .store(true, Ordering::Release);
    }

    /// Write the request bytes according to the variant.
    async fn send_request(&self, upstream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
        match self.variant {
            ScrambleVariant::Plain => upstream.write_all(data).await,
            ScrambleVariant::Fragmented => {
                upstream.set_nodelay(true)?;
                let split = SCRAMBLE_FRAGMENT.min(data.len());
                upstream.write_all(&data[..split]).await?;
                upstream.flush().await?;
                if split < data.len() {
                    upstream.write_all(&data[split..]).await?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ProxyBackend for HttpTryProxy {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "http-try"
    }

    fn health(&self) -> &BackendHealth {
        &self.health
    }

    fn is_direct(&self) -> bool {
        true
    }

    fn supports(&self, protocol: Protocol, _session: Option<&Session>) -> bool {
        protocol == Protocol::Http
    }

    async fn forward(
        &self,
        session: &mut Session,
        ctx: &GatewayContext,
    ) -> Result<ForwardOutcome, SessionError> {
        if !session.host.is_empty() {
            if self.host_black_list.contains(&session.host) {
                return Ok(ForwardOutcome::Fallback {
                    reason: "host black listed".into(),
                    silent: true,
                });
            }
            if self.slow_detection_enabled() && self.host_slow_list.contains(&session.host) {
                return Ok(ForwardOutcome::Fallback {
                    reason: "host slow via direct".into(),
                    silent: true,
                });
            }
        }
        if !looks_like_http_request(&session.peeked_data) {
            return Ok(ForwardOutcome::NotHttp);
        }

        let (dst_ip, dst_port) = (session.dst_ip, session.dst_port);
        let (mut upstream, counter) = match open_upstream(
            session,
            ctx,
            self.id(),
            dst_ip,
            dst_port,
            ctx.timeouts.connect(),
        )
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                return Ok(ForwardOutcome::Fallback {
                    reason: format!("connect failed: {e}"),
                    silent: false,
                })
            }
        };

        if let Err(e) = self.send_request(&mut upstream, &session.peeked_data).await {
            return Ok(ForwardOutcome::Fallback {
                reason: format!("send failed: {e}"),
                silent: false,
            });
        }

        let host = session.host.clone();
        let mut opts = RelayOptions::new(&ctx.timeouts);

        if !host.is_empty() {
            let black_list = self.host_black_list.clone();
            let penalized = host.clone();
            let penalty: Penalty = Box::new(move || {
                tracing::info!(host = %penalized, "host black listed for direct access");
                black_list.insert(penalized);
            });
            opts.delayed_penalty = Some(penalty);

            if self.slow_detection_enabled() {
                let slow_list = self.host_slow_list.clone();
                let started_at = Instant::now();
                opts.on_forward_started = Some(Box::new(move || {
                    if started_at.elapsed() > SLOW_THRESHOLD {
                        tracing::info!(host = %host, "host slow via direct access");
                        slow_list.insert(host);
                    }
                }));
            }
        }

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
}

/// Sanity check: a request line of the shape `METHOD SP target SP HTTP/1.x`.
fn looks_like_http_request(data: &[u8]) -> bool {
    if data.is_empty() {
        // Nothing was peeked; the port heuristic called it HTTP, trust it.
        return true;
    }
    let line_end = data
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(data.len());
    let line = &data[..line_end];
    let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let method = match parts.next() {
        Some(m) => m,
        None => return false,
    };
    if !method.iter().all(|b| b.is_ascii_uppercase()) {
        return false;
    }
    let _target = match parts.next() {
        Some(t) => t,
        None => return false,
    };
    matches!(parts.next(), Some(v) if v.starts_with(b"HTTP/"))
}
