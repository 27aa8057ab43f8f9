//! Per-connection dispatch engine.
//!
//! # Data Flow
//! ```text
//! front_door.rs (accept, preamble parse, CONNECT / absolute-URI rewrite)
//!     → session.rs (one Session per connection)
//!     → dispatcher.rs (policy short-circuits, peek, try→fail→retry loop)
//!         → selector.rs (pick the next backend)
//!         → upstream::*::forward → relay loop
//! ```

pub mod dispatcher;
pub mod front_door;
pub mod selector;
pub mod session;

use std::sync::Arc;

use crate::config::TimeoutConfig;
use crate::net::HostResolver;
use crate::observability::stat::TrafficLedger;
use crate::policy::HostPolicies;
use crate::registry::ProxyRegistry;

/// Everything a session needs besides its own state. One per process,
/// shared by reference into every session task.
pub struct GatewayContext {
    pub registry: Arc<ProxyRegistry>,
    pub policies: Arc<HostPolicies>,
    pub resolver: Arc<HostResolver>,
    pub ledger: Arc<TrafficLedger>,
    pub timeouts: TimeoutConfig,
}
