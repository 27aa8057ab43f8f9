//! US exit-IP membership with an on-disk cache.
//!
//! The actual geolocation source is an external collaborator behind
//! [`UsIpProbe`]; this module owns the cache and its persistence. An IP with
//! no cached verdict and no probe answer is treated as not-US, which keeps
//! the force-US gate strict.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

/// External geolocation lookup. `None` means the probe could not decide.
pub trait UsIpProbe: Send + Sync {
    fn is_us(&self, ip: IpAddr) -> Option<bool>;
}

pub struct UsIpCache {
    map: DashMap<IpAddr, bool>,
    path: Option<PathBuf>,
    probe: Option<Arc<dyn UsIpProbe>>,
}

impl UsIpCache {
    pub fn new(path: Option<PathBuf>, probe: Option<Arc<dyn UsIpProbe>>) -> Self {
        let cache = Self {
            map: DashMap::new(),
            path,
            probe,
        };
        cache.load();
        cache
    }

    /// Cache with no persistence and no probe; unknown IPs are never US.
    pub fn in_memory() -> Self {
        Self {
            map: DashMap::new(),
            path: None,
            probe: None,
        }
    }

    /// Pre-seed a verdict, as tests and the startup warm-up do.
    pub fn insert(&self, ip: IpAddr, is_us: bool) {
        self.map.insert(ip, is_us);
    }

    pub fn is_us_ip(&self, ip: Option<IpAddr>) -> bool {
        let Some(ip) = ip else { return false };
        if let Some(cached) = self.map.get(&ip) {
            return *cached;
        }
        let verdict = self
            .probe
            .as_ref()
            .and_then(|p| p.is_us(ip))
            .unwrap_or(false);
        self.map.insert(ip, verdict);
        verdict
    }

    pub fn load(&self) {
        let Some(path) = &self.path else { return };
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Vec<(IpAddr, bool)>>(&content) {
                Ok(entries) => {
                    for (ip, verdict) in entries {
                        self.map.insert(ip, verdict);
                    }
                    tracing::info!(path = %path.display(), entries = self.map.len(), "loaded US-IP cache");
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "corrupt US-IP cache ignored"),
            },
            // First run: the cache file does not exist yet.
            Err(_) => {}
        }
    }

    pub fn save(&self) {
        let Some(path) = &self.path else { return };
        let entries: Vec<(IpAddr, bool)> = self.map.iter().map(|e| (*e.key(), *e.value())).collect();
        match serde_json::to_string(&entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to persist US-IP cache");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize US-IP cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_ip_is_not_us() {
        let cache = UsIpCache::in_memory();
        assert!(!cache.is_us_ip(Some("8.8.8.8".parse().unwrap())));
        assert!(!cache.is_us_ip(None));
    }

    #[test]
    fn seeded_verdict_wins() {
        let cache = UsIpCache::in_memory();
        let ip: IpAddr = "8.8.8.8".parse().unwrap();
        cache.insert(ip, true);
        assert!(cache.is_us_ip(Some(ip)));
    }

    #[test]
    fn cache_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("us-ip-cache-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("us_ip");

        let first = UsIpCache::new(Some(path.clone()), None);
        let ip: IpAddr = "4.4.4.4".parse().unwrap();
        first.insert(ip, true);
        first.save();

        let second = UsIpCache::new(Some(path.clone()), None);
        assert!(second.is_us_ip(Some(ip)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    struct AlwaysUs;
    impl UsIpProbe for AlwaysUs {
        fn is_us(&self, _ip: IpAddr) -> Option<bool> {
            Some(true)
        }
    }

    #[test]
    fn probe_result_is_cached() {
        let cache = UsIpCache::new(None, Some(Arc::new(AlwaysUs)));
        let ip: IpAddr = "9.9.9.9".parse().unwrap();
        assert!(cache.is_us_ip(Some(ip)));
        assert!(cache.map.contains_key(&ip));
    }
}
