//! Per-upstream traffic accounting.
//!
//! Every upstream socket a session opens gets a [`TrafficCounter`] handle
//! registered in the process-wide [`TrafficLedger`]. Counters are closed
//! exactly once when the owning session ends; closed counters stay in the
//! ledger until `clear()` so totals survive the connections they measured.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::observability::metrics;
use crate::upstream::BackendId;

/// Byte counters for one upstream connection.
pub struct TrafficCounter {
    pub id: u64,
    pub backend: BackendId,
    pub host: String,
    pub dst_ip: IpAddr,
    pub opened_at: Instant,
    rx: AtomicU64,
    tx: AtomicU64,
    closed: AtomicBool,
}

impl TrafficCounter {
    /// Bytes received from the upstream.
    pub fn received(&self, n: usize) {
        self.rx.fetch_add(n as u64, Ordering::Relaxed);
        metrics::record_relayed("upstream_to_downstream", n as u64);
    }

    /// Bytes sent towards the upstream.
    pub fn sending(&self, n: usize) {
        self.tx.fetch_add(n as u64, Ordering::Relaxed);
        metrics::record_relayed("downstream_to_upstream", n as u64);
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx.load(Ordering::Relaxed)
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx.load(Ordering::Relaxed)
    }

    /// Mark the counter closed. Idempotent; returns true on the first call.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Process-wide registry of traffic counters.
#[derive(Default)]
pub struct TrafficLedger {
    counters: DashMap<u64, Arc<TrafficCounter>>,
    next_id: AtomicU64,
}

impl TrafficLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a counter for a freshly-opened upstream socket.
    pub fn opened(&self, backend: BackendId, host: String, dst_ip: IpAddr) -> Arc<TrafficCounter> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let counter = Arc::new(TrafficCounter {
            id,
            backend,
            host,
            dst_ip,
            opened_at: Instant::now(),
            rx: AtomicU64::new(0),
            tx: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.counters.insert(id, counter.clone());
        counter
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<TrafficCounter>> {
        self.counters.iter().map(|e| e.value().clone()).collect()
    }

    /// Drop all counters, as `clear_states` does.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_closes_exactly_once() {
        let ledger = TrafficLedger::new();
        let c = ledger.opened(
            BackendId::new("direct"),
            "example.org".into(),
            "1.2.3.4".parse().unwrap(),
        );
        assert!(c.close());
        assert!(!c.close());
        assert!(c.is_closed());
    }

    #[test]
    fn ledger_tracks_and_clears() {
        let ledger = TrafficLedger::new();
        let c = ledger.opened(
            BackendId::new("direct"),
            String::new(),
            "1.2.3.4".parse().unwrap(),
        );
        c.received(100);
        c.sending(40);
        assert_eq!(ledger.len(), 1);
        assert_eq!(c.rx_bytes(), 100);
        assert_eq!(c.tx_bytes(), 40);
        ledger.clear();
        assert!(ledger.is_empty());
    }
}
