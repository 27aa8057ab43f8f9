//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Session events (picks, fallbacks, completions)
//!     → metrics.rs (Prometheus counters/gauges)
//!
//! Upstream sockets
//!     → stat.rs (per-connection traffic counters, process-wide ledger)
//!     → metrics.rs (relayed byte totals)
//! ```
//!
//! # Design Decisions
//! - tracing for structured logs; metrics for aggregates; the ledger for
//!   per-connection accounting
//! - Counters are cheap atomics; no locking on the hot relay path

pub mod metrics;
pub mod stat;
