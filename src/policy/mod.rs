//! Host classification tables.
//!
//! # Responsibilities
//! - Answer the dispatch-time questions: is this LAN traffic, a China
//!   destination, a GFW-poisoned answer, a blocked Google host?
//! - Gate backend selection on US exit IPs when forced
//!
//! # Design Decisions
//! - All tables live behind one injected `HostPolicies` value so tests can
//!   substitute their own ranges
//! - The real LAN / China / US databases are external; the defaults here are
//!   conservative seeds, extended from configuration

pub mod us_ip;

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;

use crate::config::PolicyConfig;
use us_ip::UsIpCache;

/// IP addresses the GFW is known to inject as poisoned DNS replies.
/// Receiving one of these as a destination means the client resolved
/// through a tampered path.
const WRONG_ANSWER_SEED: [&str; 6] = [
    "8.7.198.45",
    "46.82.174.68",
    "59.24.3.173",
    "93.46.8.89",
    "203.98.7.65",
    "243.185.187.39",
];

const LAN_RANGE_SEED: [&str; 5] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "127.0.0.0/8",
];

/// Bundle of read-through host policy tables.
pub struct HostPolicies {
    lan_ranges: Vec<IpNet>,
    china_ranges: Vec<IpNet>,
    china_domain_suffixes: Vec<String>,
    wrong_answers: HashSet<IpAddr>,
    blocked_google_suffixes: Vec<String>,
    pub us_ip: UsIpCache,
}

impl HostPolicies {
    pub fn from_config(cfg: &PolicyConfig, us_ip_cache: UsIpCache) -> Self {
        let mut wrong_answers: HashSet<IpAddr> = WRONG_ANSWER_SEED
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        wrong_answers.extend(cfg.wrong_answer_ips.iter().copied());

        let china_ranges = match &cfg.china_ip_file {
            Some(path) => load_ranges(path),
            None => Vec::new(),
        };

        Self {
            lan_ranges: LAN_RANGE_SEED
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            china_ranges,
            china_domain_suffixes: cfg.china_domain_suffixes.clone(),
            wrong_answers,
            blocked_google_suffixes: cfg.blocked_google_suffixes.clone(),
            us_ip: us_ip_cache,
        }
    }

    /// Replace the LAN ranges wholesale. Integration tests use this to keep
    /// loopback traffic from short-circuiting to DIRECT.
    pub fn with_lan_ranges(mut self, ranges: Vec<IpNet>) -> Self {
        self.lan_ranges = ranges;
        self
    }

    pub fn is_lan_traffic(&self, src: IpAddr, dst: IpAddr) -> bool {
        self.is_lan_ip(src) && self.is_lan_ip(dst)
    }

    fn is_lan_ip(&self, ip: IpAddr) -> bool {
        self.lan_ranges.iter().any(|net| net.contains(&ip))
    }

    pub fn is_china_ip(&self, ip: IpAddr) -> bool {
        self.china_ranges.iter().any(|net| net.contains(&ip))
    }

    pub fn is_china_domain(&self, host: &str) -> bool {
        !host.is_empty() && matches_suffix(host, &self.china_domain_suffixes)
    }

    pub fn is_wrong_answer(&self, ip: IpAddr) -> bool {
        self.wrong_answers.contains(&ip)
    }

    pub fn is_blocked_google_host(&self, host: &str) -> bool {
        !host.is_empty() && matches_suffix(host, &self.blocked_google_suffixes)
    }
}

fn matches_suffix(host: &str, suffixes: &[String]) -> bool {
    suffixes
        .iter()
        .any(|s| host == s.as_str() || host.ends_with(&format!(".{s}")))
}

/// Load one CIDR per line; comments and malformed lines are skipped.
fn load_ranges(path: &Path) -> Vec<IpNet> {
    match std::fs::read_to_string(path) {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.parse().ok())
            .collect(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to load IP range file");
            Vec::new()
        }
    }
}
