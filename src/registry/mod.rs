//! Backend pool ownership and lifecycle.
//!
//! # Responsibilities
//! - Own the refreshable pool and the six pseudo-backends
//! - Hold the runtime-mutable global flags
//! - Serialize refresh behind a 60-second cooldown
//! - Decide when the pool is broken enough to auto-fix, and latch auto-fix
//!   off when fixing proves ineffective
//!
//! # Design Decisions
//! - Backends are never removed; death is a flag, not a deletion
//! - The pool is an atomically-swapped vector: reads are lock-free on the
//!   session path, appends are rare
//! - The refresh cooldown also covers "directory not loaded yet"

pub mod directory;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;

use crate::config::{FlagsConfig, PrivateServerConfig, PublicServersConfig};
use crate::net::HostResolver;
use crate::observability::stat::TrafficLedger;
use crate::sniff::Protocol;
use crate::upstream::backend::{BackendKind, InstanceRefreshKind, ProxyBackend};
use crate::upstream::direct::{DirectProxy, HttpsTryProxy, NoneProxy};
use crate::upstream::http_connect::HttpConnectProxy;
use crate::upstream::http_relay::HttpRelayProxy;
use crate::upstream::http_try::HttpTryProxy;

const REFRESH_COOLDOWN: Duration = Duration::from_secs(60);

/// Runtime-mutable global knobs. The admin surface mutates the canonical
/// copy here; sessions snapshot what they need at creation.
#[derive(Debug)]
pub struct GlobalFlags {
    auto_fix_enabled: AtomicBool,
    china_shortcut_enabled: AtomicBool,
    direct_access_enabled: AtomicBool,
    tcp_scrambler_enabled: AtomicBool,
    google_scrambler_enabled: AtomicBool,
    goagent_public_servers_enabled: AtomicBool,
    ss_public_servers_enabled: AtomicBool,
    force_us_ip: AtomicBool,
}

macro_rules! flag_accessors {
    ($($field:ident => $get:ident / $set:ident),+ $(,)?) => {
        $(
            pub fn $get(&self) -> bool {
                self.$field.load(Ordering::Acquire)
            }

            pub fn $set(&self, value: bool) {
                self.$field.store(value, Ordering::Release);
            }
        )+
    };
}

impl GlobalFlags {
    pub fn new(flags: &FlagsConfig, public: &PublicServersConfig) -> Self {
        Self {
            auto_fix_enabled: AtomicBool::new(flags.auto_fix),
            china_shortcut_enabled: AtomicBool::new(flags.china_shortcut),
            direct_access_enabled: AtomicBool::new(flags.direct_access),
            tcp_scrambler_enabled: AtomicBool::new(flags.tcp_scrambler),
            google_scrambler_enabled: AtomicBool::new(flags.google_scrambler),
            goagent_public_servers_enabled: AtomicBool::new(public.goagent_enabled),
            ss_public_servers_enabled: AtomicBool::new(public.ss_enabled),
            force_us_ip: AtomicBool::new(flags.force_us_ip),
        }
    }

    flag_accessors! {
        auto_fix_enabled => auto_fix_enabled / set_auto_fix_enabled,
        china_shortcut_enabled => china_shortcut_enabled / set_china_shortcut_enabled,
        direct_access_enabled => direct_access_enabled / set_direct_access_enabled,
        tcp_scrambler_enabled => tcp_scrambler_enabled / set_tcp_scrambler_enabled,
        google_scrambler_enabled => google_scrambler_enabled / set_google_scrambler_enabled,
        goagent_public_servers_enabled => goagent_public_servers_enabled / set_goagent_public_servers_enabled,
        ss_public_servers_enabled => ss_public_servers_enabled / set_ss_public_servers_enabled,
        force_us_ip => force_us_ip / set_force_us_ip,
    }
}

/// Where the refresh clock stands.
enum RefreshClock {
    /// The directory has not produced its first answer; refresh is a no-op.
    DirectoryPending,
    /// Refreshable, last started at the given instant (if ever).
    Armed(Option<Instant>),
}

/// Process-wide singleton owning the backend pool.
pub struct ProxyRegistry {
    pool: ArcSwap<Vec<Arc<dyn ProxyBackend>>>,
    kinds: HashMap<&'static str, Arc<dyn BackendKind>>,
    refresh_clock: Mutex<RefreshClock>,
    dns_polluted_at: AtomicI64,

    pub flags: GlobalFlags,
    pub ledger: Arc<TrafficLedger>,
    pub resolver: Arc<HostResolver>,

    // Pseudo-backends; never part of the refreshable pool.
    pub direct: Arc<DirectProxy>,
    pub http_try: Arc<HttpTryProxy>,
    pub tcp_scrambler: Arc<HttpTryProxy>,
    pub google_scrambler: Arc<HttpTryProxy>,
    pub https_try: Arc<HttpsTryProxy>,
    pub none: Arc<NoneProxy>,
}

impl ProxyRegistry {
    pub fn new(
        flags: GlobalFlags,
        ledger: Arc<TrafficLedger>,
        resolver: Arc<HostResolver>,
    ) -> Self {
        let mut kinds: HashMap<&'static str, Arc<dyn BackendKind>> = HashMap::new();
        for tag in ["http-relay", "http-connect", "dynamic"] {
            kinds.insert(tag, Arc::new(InstanceRefreshKind::new(tag, resolver.clone())));
        }

        Self {
            pool: ArcSwap::from_pointee(Vec::new()),
            kinds,
            refresh_clock: Mutex::new(RefreshClock::DirectoryPending),
            dns_polluted_at: AtomicI64::new(0),
            flags,
            ledger,
            resolver,
            direct: Arc::new(DirectProxy::new()),
            http_try: Arc::new(HttpTryProxy::http_try()),
            tcp_scrambler: Arc::new(HttpTryProxy::tcp_scrambler()),
            google_scrambler: Arc::new(HttpTryProxy::google_scrambler()),
            https_try: Arc::new(HttpsTryProxy::new()),
            none: Arc::new(NoneProxy::new()),
        }
    }

    pub fn list_backends(&self) -> Arc<Vec<Arc<dyn ProxyBackend>>> {
        self.pool.load_full()
    }

    pub fn add_backend(&self, backend: Arc<dyn ProxyBackend>) {
        self.add_backends(vec![backend]);
    }

    pub fn add_backends(&self, backends: Vec<Arc<dyn ProxyBackend>>) {
        self.pool.rcu(|pool| {
            let mut next = Vec::with_capacity(pool.len() + backends.len());
            next.extend(pool.iter().cloned());
            next.extend(backends.iter().cloned());
            next
        });
    }

    /// Build pool entries from the static `private_servers` configuration.
    /// A malformed entry is logged and skipped; it cannot poison the pool.
    pub fn init_from_config(&self, private_servers: &HashMap<String, PrivateServerConfig>) {
        let mut built: Vec<Arc<dyn ProxyBackend>> = Vec::new();
        for (id, server) in private_servers {
            match server {
                PrivateServerConfig::Http {
                    host,
                    port,
                    username,
                    password,
                    transport_type,
                    traffic_type,
                } => {
                    if transport_type.as_deref() == Some("SSL") {
                        tracing::warn!(server = %id, "SSL transport not built in, skipped");
                        continue;
                    }
                    let traffic = traffic_type.as_deref().unwrap_or("HTTP|HTTPS");
                    if traffic.contains("HTTP") {
                        built.push(Arc::new(HttpRelayProxy::new(
                            host.clone(),
                            *port,
                            username.clone(),
                            password.clone(),
                            0,
                        )));
                    }
                    if traffic.contains("HTTPS") {
                        built.push(Arc::new(HttpConnectProxy::new(
                            host.clone(),
                            *port,
                            username.clone(),
                            password.clone(),
                            0,
                        )));
                    }
                }
                other => {
                    tracing::warn!(
                        server = %id,
                        proxy_type = other.type_name(),
                        "backend type is an external collaborator, skipped"
                    );
                }
            }
        }
        if !built.is_empty() {
            tracing::info!(count = built.len(), "loaded private servers");
            self.add_backends(built);
        }
    }

    /// Arm the refresh clock once the directory has answered.
    pub fn mark_directory_loaded(&self) {
        *self
            .refresh_clock
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = RefreshClock::Armed(None);
    }

    /// Refresh every pool backend, grouped by type. Guarded by a 60-second
    /// cooldown: a second call within the window returns false untouched.
    pub async fn refresh(&self) -> bool {
        {
            let mut clock = self.refresh_clock.lock().unwrap_or_else(|e| e.into_inner());
            match &*clock {
                RefreshClock::DirectoryPending => {
                    tracing::warn!("skip refresh: directory not loaded yet");
                    return false;
                }
                RefreshClock::Armed(Some(at)) if at.elapsed() < REFRESH_COOLDOWN => {
                    tracing::debug!(
                        elapsed_secs = at.elapsed().as_secs(),
                        "skip refresh: cooldown active"
                    );
                    return false;
                }
                RefreshClock::Armed(_) => *clock = RefreshClock::Armed(Some(Instant::now())),
            }
        }

        let pool = self.pool.load_full();
        tracing::info!(backends = pool.len(), "refreshing backends");

        let mut by_tag: HashMap<&'static str, Vec<Arc<dyn ProxyBackend>>> = HashMap::new();
        for backend in pool.iter() {
            by_tag.entry(backend.kind()).or_default().push(backend.clone());
        }

        let mut success = true;
        for (tag, instances) in by_tag {
            match self.kinds.get(tag) {
                Some(kind) => success &= kind.refresh(&instances).await,
                None => tracing::debug!(tag, "no refresher registered for type"),
            }
        }
        tracing::info!(success, "backend refresh finished");
        success
    }

    /// Whether the pool is broken enough that an automatic refresh should
    /// be attempted: all HTTP-capable or all HTTPS-capable backends died,
    /// each protocol considered only while its public class is enabled.
    pub fn should_fix(&self) -> bool {
        if !self.flags.auto_fix_enabled() {
            return false;
        }
        let pool = self.pool.load_full();
        let all_died = |protocol: Protocol| {
            pool.iter()
                .filter(|b| b.supports(protocol, None))
                .all(|b| b.died())
        };
        let http_died = self.flags.goagent_public_servers_enabled() && all_died(Protocol::Http);
        let https_died = self.flags.ss_public_servers_enabled() && all_died(Protocol::Https);
        if http_died || https_died {
            tracing::info!(http_died, https_died, "backend pool needs fixing");
            true
        } else {
            false
        }
    }

    /// One-shot auto-fix: refresh, and if the pool still looks broken,
    /// latch auto-fix off for the rest of the process.
    pub async fn fix_by_refreshing(&self) {
        if self.refresh().await && self.should_fix() {
            tracing::error!("auto fix did not help, disabling it");
            self.flags.set_auto_fix_enabled(false);
        }
    }

    /// Forget all learned state: black/slow lists, latency and failure
    /// counters, traffic counters, and the refresh cooldown.
    pub fn clear_states(&self) {
        *self
            .refresh_clock
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = RefreshClock::Armed(None);
        self.http_try.clear_lists();
        self.tcp_scrambler.clear_lists();
        self.google_scrambler.clear_lists();
        self.https_try.clear_lists();
        for backend in self.pool.load_full().iter() {
            backend.clear_latency_records();
            backend.clear_failed_times();
        }
        self.ledger.clear();
        tracing::info!("backend states cleared");
    }

    pub fn mark_dns_polluted(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.dns_polluted_at.store(now, Ordering::Release);
    }

    /// Epoch seconds of the last detected wrong-answer hit; 0 if never.
    pub fn dns_polluted_at(&self) -> i64 {
        self.dns_polluted_at.load(Ordering::Acquire)
    }
}
