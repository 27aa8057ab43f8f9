//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! gateway. All types derive Serde traits for deserialization from config
//! files.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Front-door listener (bind address, backpressure).
    pub listener: ListenerConfig,

    /// Connect/idle/sniff timing knobs.
    pub timeouts: TimeoutConfig,

    /// Initial values of the runtime-mutable flags.
    pub flags: FlagsConfig,

    /// DNS-TXT directory of public backends.
    pub public_servers: PublicServersConfig,

    /// Statically configured backends, keyed by an operator-chosen id.
    pub private_servers: HashMap<String, PrivateServerConfig>,

    /// Host classification tables.
    pub policy: PolicyConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:2516").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:2516".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Timing knobs for the relay and the sniffer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream must produce its first byte within this window.
    pub connect_secs: u64,

    /// Idle timeout once forwarding has started.
    pub idle_secs: u64,

    /// How long to wait for first client bytes before sniffing blind.
    pub sniff_wait_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 7,
            idle_secs: 360,
            sniff_wait_ms: 100,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn sniff_wait(&self) -> Duration {
        Duration::from_millis(self.sniff_wait_ms)
    }
}

/// Startup values for the runtime-mutable global flags.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FlagsConfig {
    pub auto_fix: bool,
    pub china_shortcut: bool,
    pub direct_access: bool,
    pub tcp_scrambler: bool,
    pub google_scrambler: bool,
    pub force_us_ip: bool,
}

impl Default for FlagsConfig {
    fn default() -> Self {
        Self {
            auto_fix: true,
            china_shortcut: true,
            direct_access: true,
            tcp_scrambler: true,
            google_scrambler: true,
            force_us_ip: false,
        }
    }
}

/// DNS-TXT directory settings for public backend discovery.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PublicServersConfig {
    /// Directory DNS name queried for TXT records.
    pub source: String,

    pub goagent_enabled: bool,
    pub ss_enabled: bool,

    /// Background refresh cadence; 0 disables the periodic task.
    pub refresh_interval_secs: u64,
}

impl Default for PublicServersConfig {
    fn default() -> Self {
        Self {
            source: "proxies.fqrouter.com".to_string(),
            goagent_enabled: true,
            ss_enabled: true,
            refresh_interval_secs: 0,
        }
    }
}

impl PublicServersConfig {
    /// Whether a directory type tag is enabled, `<type>_enabled` style.
    pub fn type_enabled(&self, tag: &str) -> bool {
        match tag {
            "goagent" => self.goagent_enabled,
            "ss" => self.ss_enabled,
            _ => false,
        }
    }
}

/// One statically configured backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "proxy_type")]
pub enum PrivateServerConfig {
    GoAgent {
        appid: String,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        goagent_password: Option<String>,
    },
    #[serde(rename = "SSH")]
    Ssh {
        host: String,
        port: u16,
        username: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        connections_count: Option<u32>,
    },
    Shadowsocks {
        host: String,
        port: u16,
        password: String,
        encrypt_method: String,
    },
    #[serde(rename = "HTTP")]
    Http {
        host: String,
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        /// "SSL" means the hop itself is TLS-wrapped.
        #[serde(default)]
        transport_type: Option<String>,
        /// Any combination of "HTTP" and "HTTPS".
        #[serde(default)]
        traffic_type: Option<String>,
    },
    #[serde(rename = "SPDY")]
    Spdy {
        host: String,
        port: u16,
        username: String,
        password: String,
        #[serde(default)]
        connections_count: Option<u32>,
        #[serde(default)]
        traffic_type: Option<String>,
    },
}

impl PrivateServerConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            PrivateServerConfig::GoAgent { .. } => "GoAgent",
            PrivateServerConfig::Ssh { .. } => "SSH",
            PrivateServerConfig::Shadowsocks { .. } => "Shadowsocks",
            PrivateServerConfig::Http { .. } => "HTTP",
            PrivateServerConfig::Spdy { .. } => "SPDY",
        }
    }
}

/// Host classification tables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Optional file of China CIDR ranges, one per line.
    pub china_ip_file: Option<PathBuf>,

    /// Extra GFW wrong-answer IPs beyond the built-in seed.
    pub wrong_answer_ips: Vec<IpAddr>,

    /// Domain suffixes served acceptably from inside China.
    pub china_domain_suffixes: Vec<String>,

    /// Google host suffixes that the scrambler cascade treats as blocked.
    pub blocked_google_suffixes: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            china_ip_file: None,
            wrong_answer_ips: Vec::new(),
            china_domain_suffixes: Vec::new(),
            blocked_google_suffixes: [
                "google.com",
                "google.com.hk",
                "googleapis.com",
                "googleusercontent.com",
                "googlevideo.com",
                "gstatic.com",
                "youtube.com",
                "ytimg.com",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
