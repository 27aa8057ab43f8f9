//! Per-session fallback controller.
//!
//! # Responsibilities
//! - Apply the policy short-circuits (LAN, GFW wrong answers, China fast
//!   path) before any bytes are peeked
//! - Peek the first client bytes and classify the protocol
//! - Drive the try→fail→retry loop across backends, at most three picks
//! - Enforce the "no fallback once a byte reached the client" invariant
//! - Close every session resource exactly once, on every exit path

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::Instrument;

use crate::gateway::selector;
use crate::gateway::session::{Session, SessionError};
use crate::gateway::GatewayContext;
use crate::observability::metrics;
use crate::sniff;
use crate::upstream::{ForwardOutcome, ProxyBackend};

const MAX_PICKS: usize = 3;
const PEEK_BUFSIZE: usize = 8192;

enum DispatchEnd {
    Done,
    NoMoreProxy,
}

/// Entry point for one accepted connection. Consumes the session and
/// guarantees resource cleanup.
pub async fn handle_session(session: Session, ctx: Arc<GatewayContext>) {
    let span = tracing::info_span!("session", id = %session.id);
    run_session(session, ctx).instrument(span).await;
}

async fn run_session(mut session: Session, ctx: Arc<GatewayContext>) {
    tracing::debug!(session = %session, "downstream connected");
    let outcome = dispatch(&mut session, &ctx).await;
    match outcome {
        Ok(DispatchEnd::Done) => {
            metrics::record_session(&session.protocol.to_string(), "done");
            tracing::debug!(session = %session, "done");
        }
        Ok(DispatchEnd::NoMoreProxy) => {
            metrics::record_session(&session.protocol.to_string(), "no_more_proxy");
            // A host stuck on the slow list exhausting every backend means
            // slow detection itself is doing damage: latch it off.
            let http_try = &ctx.registry.http_try;
            if http_try.slow_detection_enabled()
                && !session.host.is_empty()
                && http_try.host_slow_list.contains(&session.host)
            {
                tracing::error!("disabling host slow detection");
                http_try.disable_slow_detection();
            }
        }
        Err(e) => {
            metrics::record_session(&session.protocol.to_string(), "error");
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(session = %session, error = ?e, "done with error");
            } else {
                tracing::info!(session = %session, error = %e, "done with error");
            }
        }
    }
    session.close();
}

async fn dispatch(
    session: &mut Session,
    ctx: &GatewayContext,
) -> Result<DispatchEnd, SessionError> {
    let registry = &ctx.registry;

    if ctx.policies.is_lan_traffic(session.src.ip(), session.dst_ip) {
        forward_direct_ignoring_fallback(session, ctx).await?;
        return Ok(DispatchEnd::Done);
    }

    if ctx.policies.is_wrong_answer(session.dst_ip) {
        tracing::error!(session = %session, "destination is a GFW wrong answer");
        registry.mark_dns_polluted();
        let none = registry.none.clone();
        none.forward(session, ctx).await?;
        return Ok(DispatchEnd::Done);
    }

    if registry.flags.china_shortcut_enabled() && ctx.policies.is_china_ip(session.dst_ip) {
        forward_direct_ignoring_fallback(session, ctx).await?;
        return Ok(DispatchEnd::Done);
    }

    if registry.should_fix() {
        let registry = ctx.registry.clone();
        tokio::spawn(async move { registry.fix_by_refreshing().await });
    }

    peek(session, ctx).await;

    if registry.flags.china_shortcut_enabled() && ctx.policies.is_china_domain(&session.host) {
        forward_direct_ignoring_fallback(session, ctx).await?;
        return Ok(DispatchEnd::Done);
    }

    for _ in 0..MAX_PICKS {
        let Some(backend) = selector::pick(session, ctx) else {
            return Ok(DispatchEnd::NoMoreProxy);
        };
        session.forwarding_by = Some(backend.id().clone());
        metrics::record_pick(backend.id().as_str());
        if backend.is_direct() {
            tracing::debug!(session = %session, "picked backend");
        } else {
            tracing::info!(session = %session, "picked backend");
        }

        match backend.forward(session, ctx).await? {
            ForwardOutcome::Completed => return Ok(DispatchEnd::Done),
            ForwardOutcome::Fallback { reason, silent } => {
                if session.forward_started {
                    // This must never happen; a backend that got bytes to
                    // the client has no business asking for a retry.
                    tracing::error!(session = %session, reason = %reason, "fallback after forward started");
                    return Err(SessionError::LateFallback(reason));
                }
                if !silent {
                    tracing::error!(
                        session = %session,
                        backend = %backend.id(),
                        reason = %reason,
                        "falling back to another backend"
                    );
                }
                metrics::record_fallback(backend.id().as_str());
                session.mark_tried(backend.id().clone(), reason);
            }
            ForwardOutcome::NotHttp => {
                // The flow lied about being HTTP; hand it to DIRECT once
                // and give up if that also falls back.
                let direct = registry.direct.clone();
                let _ = direct.forward(session, ctx).await?;
                return Ok(DispatchEnd::Done);
            }
        }
    }
    Ok(DispatchEnd::NoMoreProxy)
}

async fn forward_direct_ignoring_fallback(
    session: &mut Session,
    ctx: &GatewayContext,
) -> Result<(), SessionError> {
    let direct = ctx.registry.direct.clone();
    session.forwarding_by = Some(direct.id().clone());
    match direct.forward(session, ctx).await? {
        ForwardOutcome::Completed => {}
        ForwardOutcome::Fallback { reason, .. } => {
            tracing::debug!(session = %session, reason = %reason, "direct short-circuit failed");
        }
        ForwardOutcome::NotHttp => {}
    }
    Ok(())
}

/// Wait briefly for first bytes if none were captured by the front door,
/// then classify the protocol and extract the host.
async fn peek(session: &mut Session, ctx: &GatewayContext) {
    if session.peeked_data.is_empty() {
        let wait = ctx.timeouts.sniff_wait();
        let mut buf = vec![0u8; PEEK_BUFSIZE];
        match tokio::time::timeout(wait, session.downstream.read(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                session.peeked_data = Bytes::from(buf);
            }
            Ok(Err(e)) => {
                tracing::error!(session = %session, error = %e, "peek failed");
            }
            Err(_) => {
                tracing::debug!(session = %session, "peek timed out");
            }
        }
    }
    let (protocol, host) = sniff::analyze(&session.peeked_data, session.dst_port);
    tracing::debug!(session = %session, protocol = %protocol, host = %host, "analyzed traffic");
    session.protocol = protocol;
    session.host = host;
}
