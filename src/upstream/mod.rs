//! Upstream circumvention strategies.
//!
//! # Data Flow
//! ```text
//! Selector picks a backend
//!     → backend.rs (ProxyBackend trait, shared health bookkeeping)
//!     → direct.rs / http_try.rs (pseudo-backends, never in the pool)
//!     → http_relay.rs / http_connect.rs (plaintext HTTP tunnel family)
//!     → dynamic.rs (directory-loaded entries delegating to a concrete type)
//!     → relay loop moves bytes until the session ends or falls back
//! ```

pub mod backend;
pub mod direct;
pub mod dynamic;
pub mod http_connect;
pub mod http_relay;
pub mod http_try;

pub use backend::{
    BackendHealth, BackendId, BackendKind, ForwardOutcome, ProxyBackend, FAILED_TIMES_TO_DIE,
};

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::gateway::session::Session;
use crate::gateway::GatewayContext;
use crate::observability::stat::TrafficCounter;

/// Open a TCP connection to an upstream on behalf of a session, registering
/// a traffic counter that the session will close with its other resources.
pub(crate) async fn open_upstream(
    session: &mut Session,
    ctx: &GatewayContext,
    by: &BackendId,
    ip: IpAddr,
    port: u16,
    connect_timeout: Duration,
) -> std::io::Result<(TcpStream, Arc<TrafficCounter>)> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((ip, port)))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    let counter = ctx
        .ledger
        .opened(by.clone(), session.host.clone(), session.dst_ip);
    session.track_counter(counter.clone());
    Ok((stream, counter))
}

/// Probe TCP reachability of an endpoint, returning the connect latency in
/// milliseconds. `None` means unreachable within the probe window.
pub(crate) async fn probe_latency(ip: IpAddr, port: u16) -> Option<u64> {
    let started = std::time::Instant::now();
    match tokio::time::timeout(Duration::from_secs(5), TcpStream::connect((ip, port))).await {
        Ok(Ok(_stream)) => Some(started.elapsed().as_millis() as u64),
        _ => None,
    }
}
