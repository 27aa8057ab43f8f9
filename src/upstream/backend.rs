//! Backend abstraction.
//!
//! # Responsibilities
//! - Define the contract every upstream strategy satisfies
//! - Share the health bookkeeping (died flag, latency records, failures)
//! - Describe backend types for batch refresh

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::gateway::session::{Session, SessionError};
use crate::gateway::GatewayContext;
use crate::observability::metrics;
use crate::sniff::Protocol;

/// Consecutive handshake failures after which a backend marks itself died.
pub const FAILED_TIMES_TO_DIE: u32 = 3;

/// Display identity of a backend; also the key of a session's `tried` map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendId(Arc<str>);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of one `forward` attempt.
///
/// Fallback is not an error in the systems sense: it is the second success
/// case of a try-style backend, raised strictly before any byte has been
/// delivered to the client. Post-start failures travel as `SessionError`.
#[derive(Debug)]
pub enum ForwardOutcome {
    /// Relaying ran to completion (or the backend consumed the session).
    Completed,
    /// Try the next backend; no byte reached the client.
    Fallback { reason: String, silent: bool },
    /// A plaintext-HTTP backend discovered the flow is not HTTP after all.
    NotHttp,
}

/// Shared mutable health state embedded by every backend implementation.
#[derive(Debug, Default)]
pub struct BackendHealth {
    died: AtomicBool,
    latency_ms: AtomicU64,
    failed_times: AtomicU32,
    records: Mutex<Vec<u64>>,
}

impl BackendHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn died(&self) -> bool {
        self.died.load(Ordering::Acquire)
    }

    pub fn set_died(&self, died: bool) {
        self.died.store(died, Ordering::Release);
    }

    /// Average observed latency in milliseconds; 0 means unmeasured.
    pub fn latency_ms(&self) -> u64 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    pub fn record_latency(&self, ms: u64) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push(ms);
        let avg = records.iter().sum::<u64>() / records.len() as u64;
        self.latency_ms.store(avg, Ordering::Relaxed);
    }

    pub fn failed_times(&self) -> u32 {
        self.failed_times.load(Ordering::Relaxed)
    }

    /// Count a failure; the backend dies after `FAILED_TIMES_TO_DIE` in a row.
    pub fn record_failure(&self) {
        let failures = self.failed_times.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= FAILED_TIMES_TO_DIE {
            self.set_died(true);
        }
    }

    pub fn record_success(&self) {
        self.failed_times.store(0, Ordering::Relaxed);
    }

    pub fn clear_latency(&self) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.latency_ms.store(0, Ordering::Relaxed);
    }

    pub fn clear_failed(&self) {
        self.failed_times.store(0, Ordering::Relaxed);
        self.set_died(false);
    }
}

/// Contract every upstream strategy satisfies.
#[async_trait]
pub trait ProxyBackend: Send + Sync {
    fn id(&self) -> &BackendId;

    /// Type tag grouping instances for batch refresh ("direct",
    /// "http-relay", "dynamic", ...).
    fn kind(&self) -> &'static str;

    fn health(&self) -> &BackendHealth;

    /// Lower is preferred; pool entries compete within the lowest bucket.
    fn priority(&self) -> i32 {
        0
    }

    /// Direct-family backends are logged at debug rather than info.
    fn is_direct(&self) -> bool {
        false
    }

    /// Single reachable exit IP, when known; used for US-IP gating.
    fn proxy_ip(&self) -> Option<IpAddr> {
        None
    }

    /// Whether this backend can carry the given protocol. `session` is
    /// `None` for coarse pool-wide queries such as `should_fix`.
    fn supports(&self, protocol: Protocol, session: Option<&Session>) -> bool;

    /// Relay the session to completion or signal a fallback. Must not
    /// return `Fallback` once any byte has been delivered downstream.
    async fn forward(
        &self,
        session: &mut Session,
        ctx: &GatewayContext,
    ) -> Result<ForwardOutcome, SessionError>;

    fn died(&self) -> bool {
        self.health().died()
    }

    fn set_died(&self, died: bool) {
        self.health().set_died(died);
        metrics::record_backend_died(self.id().as_str(), died);
    }

    fn latency_ms(&self) -> u64 {
        self.health().latency_ms()
    }

    fn clear_latency_records(&self) {
        self.health().clear_latency();
    }

    fn clear_failed_times(&self) {
        self.health().clear_failed();
    }

    /// Per-instance refresh body invoked by this type's [`BackendKind`].
    /// Pseudo-backends have nothing to refresh.
    async fn refresh_instance(&self, _resolver: &crate::net::HostResolver) -> bool {
        true
    }
}

impl fmt::Display for dyn ProxyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Type descriptor carrying the class-level batch refresh hook.
#[async_trait]
pub trait BackendKind: Send + Sync {
    fn tag(&self) -> &'static str;

    /// Refresh all pool instances of this type. Errors inside the hook are
    /// the hook's to log; the return value only feeds the all-types verdict.
    async fn refresh(&self, instances: &[Arc<dyn ProxyBackend>]) -> bool;
}

/// Kind descriptor for types whose refresh is just every instance
/// refreshing itself (resolve + reachability probe).
pub struct InstanceRefreshKind {
    tag: &'static str,
    resolver: Arc<crate::net::HostResolver>,
}

impl InstanceRefreshKind {
    pub fn new(tag: &'static str, resolver: Arc<crate::net::HostResolver>) -> Self {
        Self { tag, resolver }
    }
}

#[async_trait]
impl BackendKind for InstanceRefreshKind {
    fn tag(&self) -> &'static str {
        self.tag
    }

    async fn refresh(&self, instances: &[Arc<dyn ProxyBackend>]) -> bool {
        let mut ok = true;
        for instance in instances {
            let good = instance.refresh_instance(&self.resolver).await;
            if !good {
                tracing::warn!(backend = %instance.id(), "refresh failed");
            }
            ok &= good;
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_records_average() {
        let h = BackendHealth::new();
        assert_eq!(h.latency_ms(), 0);
        h.record_latency(100);
        h.record_latency(300);
        assert_eq!(h.latency_ms(), 200);
        h.clear_latency();
        assert_eq!(h.latency_ms(), 0);
    }

    #[test]
    fn repeated_failures_kill_the_backend() {
        let h = BackendHealth::new();
        for _ in 0..FAILED_TIMES_TO_DIE {
            h.record_failure();
        }
        assert!(h.died());
        h.clear_failed();
        assert!(!h.died());
        assert_eq!(h.failed_times(), 0);
    }
}
