//! Per-connection session state.
//!
//! # Responsibilities
//! - Own the downstream socket and every resource opened on its behalf
//! - Carry the sniffed protocol/host and the peeked client bytes
//! - Track which backends were tried and why
//! - Hold delayed penalties until forwarding actually starts

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::observability::stat::TrafficCounter;
use crate::sniff::Protocol;
use crate::upstream::BackendId;

/// A side-effect to apply only if the session actually starts forwarding,
/// e.g. black-listing a host a direct probe could not reach.
pub type Penalty = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream idle timeout")]
    IdleTimeout,
    #[error("fallback after forward started: {0}")]
    LateFallback(String),
}

/// One accepted front-door connection.
pub struct Session {
    pub id: Uuid,
    pub downstream: TcpStream,
    pub src: SocketAddr,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    /// Client bytes observed before any upstream was contacted. Immutable
    /// once a backend has begun consuming them.
    pub peeked_data: Bytes,
    pub host: String,
    pub protocol: Protocol,
    /// Backends already attempted (or refused for policy reasons), with the
    /// reason. Presence means exclusion, whatever the reason says.
    pub tried: HashMap<BackendId, String>,
    pub forwarding_by: Option<BackendId>,
    /// Monotonic false→true; once true, fallback is forbidden.
    pub forward_started: bool,
    /// Snapshot of the force-US flag at session creation.
    pub us_ip_only: bool,
    pub delayed_penalties: Vec<Penalty>,
    counters: Vec<Arc<TrafficCounter>>,
}

impl Session {
    pub fn new(
        downstream: TcpStream,
        src: SocketAddr,
        dst_ip: IpAddr,
        dst_port: u16,
        us_ip_only: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            downstream,
            src,
            dst_ip,
            dst_port,
            peeked_data: Bytes::new(),
            host: String::new(),
            protocol: Protocol::Unknown,
            tried: HashMap::new(),
            forwarding_by: None,
            forward_started: false,
            us_ip_only,
            delayed_penalties: Vec::new(),
            counters: Vec::new(),
        }
    }

    /// Register a traffic counter to close with the session.
    pub fn track_counter(&mut self, counter: Arc<TrafficCounter>) {
        self.counters.push(counter);
    }

    pub fn mark_tried(&mut self, backend: BackendId, reason: impl Into<String>) {
        self.tried.insert(backend, reason.into());
    }

    pub fn has_tried_id(&self, backend: &BackendId) -> bool {
        self.tried.contains_key(backend)
    }

    /// Close every owned resource. The downstream socket itself closes when
    /// the session is dropped; counters must be closed exactly once, and a
    /// second call finds them already closed.
    pub fn close(&mut self) {
        for counter in self.counters.drain(..) {
            counter.close();
        }
        self.delayed_penalties.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}:{}", self.src, self.dst_ip, self.dst_port)?;
        if !self.host.is_empty() {
            write!(f, " {}", self.host)?;
        }
        if let Some(by) = &self.forwarding_by {
            write!(f, " via {}", by)?;
        }
        Ok(())
    }
}
