//! Backend selection.
//!
//! # Responsibilities
//! - Pick the next backend for a session given protocol, destination and
//!   what has already been tried
//! - Honor the scrambler cascade for plaintext HTTP
//! - Record policy refusals in the session's tried map so the controller
//!   treats the slot as exhausted without logging a fault
//!
//! # Design Decisions
//! - Pool picks group by priority, then chase low latency among the best
//!   three; an unmeasured winner re-rolls over the whole bucket so new
//!   backends get traffic
//! - The US-IP gate is exclusion, not reordering

use std::sync::Arc;

use rand::Rng;

use crate::gateway::session::Session;
use crate::gateway::GatewayContext;
use crate::sniff::Protocol;
use crate::upstream::ProxyBackend;

fn as_backend<T: ProxyBackend + 'static>(backend: &Arc<T>) -> Arc<dyn ProxyBackend> {
    backend.clone()
}

/// Pick the next backend for this session, or `None` when nothing is left.
pub fn pick(session: &mut Session, ctx: &GatewayContext) -> Option<Arc<dyn ProxyBackend>> {
    match session.protocol {
        Protocol::Http => pick_http_try(session, ctx).or_else(|| pick_supports(session, ctx)),
        Protocol::Https => pick_https_try(session, ctx).or_else(|| pick_supports(session, ctx)),
        Protocol::Unknown => {
            if pick_supports(session, ctx).is_some() {
                pick_https_try(session, ctx).or_else(|| pick_supports(session, ctx))
            } else {
                Some(as_backend(&ctx.registry.direct))
            }
        }
    }
}

/// The plaintext-HTTP direct cascade: TCP scrambler first, the Google
/// scrambler for blocked Google hosts, plain HTTP_TRY as the quiet default.
fn pick_http_try(session: &mut Session, ctx: &GatewayContext) -> Option<Arc<dyn ProxyBackend>> {
    let registry = &ctx.registry;
    if session.us_ip_only {
        session.mark_tried(registry.http_try.id().clone(), "us ip only");
        return None;
    }
    if !registry.flags.direct_access_enabled() {
        session.mark_tried(registry.http_try.id().clone(), "direct access disabled");
        return None;
    }

    if registry.flags.tcp_scrambler_enabled() && !registry.tcp_scrambler.died() {
        if !session.has_tried_id(registry.tcp_scrambler.id()) {
            return Some(as_backend(&registry.tcp_scrambler));
        }
        if registry.flags.google_scrambler_enabled()
            && ctx.policies.is_blocked_google_host(&session.host)
            && !session.has_tried_id(registry.google_scrambler.id())
        {
            return Some(as_backend(&registry.google_scrambler));
        }
        None
    } else if registry.flags.google_scrambler_enabled() {
        if session.has_tried_id(registry.google_scrambler.id()) {
            None
        } else {
            Some(as_backend(&registry.google_scrambler))
        }
    } else if session.has_tried_id(registry.http_try.id()) {
        None
    } else {
        Some(as_backend(&registry.http_try))
    }
}

fn pick_https_try(session: &mut Session, ctx: &GatewayContext) -> Option<Arc<dyn ProxyBackend>> {
    let registry = &ctx.registry;
    if session.us_ip_only {
        session.mark_tried(registry.https_try.id().clone(), "us ip only");
        return None;
    }
    if !registry.flags.direct_access_enabled() {
        session.mark_tried(registry.https_try.id().clone(), "direct access disabled");
        return None;
    }
    if session.has_tried_id(registry.https_try.id()) {
        None
    } else {
        Some(as_backend(&registry.https_try))
    }
}

/// Pick from the refreshable pool: lowest priority bucket, low latency
/// among the best three, whole-bucket re-roll when the winner is
/// unmeasured.
pub fn pick_supports(session: &Session, ctx: &GatewayContext) -> Option<Arc<dyn ProxyBackend>> {
    let pool = ctx.registry.list_backends();
    let candidates: Vec<&Arc<dyn ProxyBackend>> = pool
        .iter()
        .filter(|b| b.supports(session.protocol, Some(session)))
        .filter(|b| !b.died())
        .filter(|b| !excluded(session, b.as_ref(), ctx))
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let best_priority = candidates.iter().map(|b| b.priority()).min()?;
    let mut bucket: Vec<&Arc<dyn ProxyBackend>> = candidates
        .into_iter()
        .filter(|b| b.priority() == best_priority)
        .collect();
    bucket.sort_by_key(|b| b.latency_ms());

    let top = &bucket[..bucket.len().min(3)];
    let picked = top[rand::thread_rng().gen_range(0..top.len())];
    if picked.latency_ms() == 0 {
        let i = rand::thread_rng().gen_range(0..bucket.len());
        return Some(bucket[i].clone());
    }
    Some(picked.clone())
}

fn excluded(session: &Session, backend: &dyn ProxyBackend, ctx: &GatewayContext) -> bool {
    if session.has_tried_id(backend.id()) {
        return true;
    }
    if session.us_ip_only && !ctx.policies.us_ip.is_us_ip(backend.proxy_ip()) {
        tracing::debug!(backend = %backend.id(), "skipped by us-ip gate");
        return true;
    }
    false
}
