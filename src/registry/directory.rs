//! Public backend discovery through a DNS-TXT directory.
//!
//! The directory name resolves to TXT records of the form
//! `PRIORITY:TYPE:COUNT:TEMPLATE`, where TEMPLATE carries a `#`
//! placeholder. Each record expands into COUNT dynamic backends named
//! `TEMPLATE(#→i).fqrouter.com`. Queries go straight to a public resolver
//! so a poisoned local path cannot hide the directory.

use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;

use crate::config::PublicServersConfig;
use crate::policy::HostPolicies;
use crate::registry::ProxyRegistry;
use crate::upstream::dynamic::{DynamicProxy, KNOWN_TYPE_TAGS};
use crate::upstream::ProxyBackend;

const DIRECTORY_DNS_SERVER: &str = "8.8.8.8:53";
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const LOAD_ATTEMPTS: u32 = 8;
const DYNAMIC_RECORD_SUFFIX: &str = "fqrouter.com";

/// One parsed directory TXT record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub priority: i32,
    pub type_tag: String,
    pub count: u32,
    pub template: String,
}

impl DirectoryRecord {
    /// Parse `PRIORITY:TYPE:COUNT:TEMPLATE`; extra fields are ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.splitn(5, ':');
        let priority = parts.next()?.trim().parse().ok()?;
        let type_tag = parts.next()?.trim().to_string();
        let count = parts.next()?.trim().parse().ok()?;
        let template = parts.next()?.trim().to_string();
        if type_tag.is_empty() || template.is_empty() {
            return None;
        }
        Some(Self {
            priority,
            type_tag,
            count,
            template,
        })
    }

    /// Expand into the record names of the individual backends.
    pub fn expand(&self) -> Vec<String> {
        (1..=self.count)
            .map(|i| {
                format!(
                    "{}.{}",
                    self.template.replace('#', &i.to_string()),
                    DYNAMIC_RECORD_SUFFIX
                )
            })
            .collect()
    }
}

/// Raw TXT query against the public directory resolver.
pub(crate) async fn query_txt(name: &str) -> io::Result<Vec<String>> {
    let mut message = Message::new();
    message
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(
            Name::from_str(name)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
            RecordType::TXT,
        ));
    let request = message
        .to_vec()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(&request, DIRECTORY_DNS_SERVER).await?;

    let mut buf = [0u8; 1024];
    let (n, _) = tokio::time::timeout(QUERY_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "directory lookup timed out"))??;

    let response = Message::from_vec(&buf[..n])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut payloads = Vec::new();
    for answer in response.answers() {
        if let Some(RData::TXT(txt)) = answer.data() {
            for chunk in txt.txt_data() {
                payloads.push(String::from_utf8_lossy(chunk).to_string());
            }
        }
    }
    Ok(payloads)
}

/// Build the dynamic backends one directory answer describes.
pub fn backends_from_records(
    payloads: &[String],
    cfg: &PublicServersConfig,
) -> Vec<Arc<dyn ProxyBackend>> {
    let mut backends: Vec<Arc<dyn ProxyBackend>> = Vec::new();
    for payload in payloads {
        let Some(record) = DirectoryRecord::parse(payload) else {
            tracing::warn!(payload = %payload, "unparseable directory record");
            continue;
        };
        if !KNOWN_TYPE_TAGS.contains(&record.type_tag.as_str()) {
            tracing::warn!(type_tag = %record.type_tag, "unknown backend type in directory");
            continue;
        }
        if !cfg.type_enabled(&record.type_tag) {
            tracing::debug!(type_tag = %record.type_tag, "backend type disabled in config");
            continue;
        }
        for dns_record in record.expand() {
            backends.push(Arc::new(DynamicProxy::new(
                dns_record,
                record.type_tag.clone(),
                record.priority,
            )));
        }
    }
    backends
}

/// Load the directory with exponential back-off, append the discovered
/// backends on the first successful lookup, then run the initial refresh.
/// Returns true once a refresh has succeeded.
pub async fn load_directory(
    registry: &ProxyRegistry,
    cfg: &PublicServersConfig,
    policies: &HostPolicies,
) -> bool {
    let mut appended = false;
    for attempt in 0..LOAD_ATTEMPTS {
        if !appended {
            match query_txt(&cfg.source).await {
                Ok(payloads) => {
                    let backends = backends_from_records(&payloads, cfg);
                    tracing::info!(count = backends.len(), source = %cfg.source, "directory loaded");
                    registry.add_backends(backends);
                    registry.mark_directory_loaded();
                    appended = true;
                }
                Err(e) => {
                    tracing::error!(source = %cfg.source, error = %e, "directory lookup failed");
                }
            }
        }
        if appended {
            // Re-arm the clock so a failed initial refresh can retry
            // without waiting out the cooldown.
            registry.mark_directory_loaded();
            if registry.refresh().await {
                warm_us_ip_cache(registry, policies);
                tracing::info!("backends initialized");
                return true;
            }
        }
        let backoff = Duration::from_secs(1u64 << attempt);
        tracing::error!(attempt, "initialization failed, retrying in {:?}", backoff);
        tokio::time::sleep(backoff).await;
    }
    tracing::error!("backend initialization failed");
    false
}

/// Learn the US verdict for every backend with a known exit IP, then
/// persist the cache.
fn warm_us_ip_cache(registry: &ProxyRegistry, policies: &HostPolicies) {
    for backend in registry.list_backends().iter() {
        if let Some(ip) = backend.proxy_ip() {
            policies.us_ip.is_us_ip(Some(ip));
        }
    }
    policies.us_ip.save();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublicServersConfig;

    #[test]
    fn parses_directory_records() {
        let rec = DirectoryRecord::parse("1:goagent:3:proxy#").unwrap();
        assert_eq!(rec.priority, 1);
        assert_eq!(rec.type_tag, "goagent");
        assert_eq!(rec.count, 3);
        assert_eq!(
            rec.expand(),
            vec![
                "proxy1.fqrouter.com",
                "proxy2.fqrouter.com",
                "proxy3.fqrouter.com"
            ]
        );
        assert!(DirectoryRecord::parse("nonsense").is_none());
        assert!(DirectoryRecord::parse("x:goagent:3:t").is_none());
    }

    #[test]
    fn disabled_and_unknown_types_are_skipped() {
        let cfg = PublicServersConfig {
            source: "d.example".into(),
            goagent_enabled: true,
            ss_enabled: false,
            refresh_interval_secs: 0,
        };
        let payloads = vec![
            "1:goagent:2:a#".to_string(),
            "2:ss:2:b#".to_string(),
            "3:carrier-pigeon:1:c#".to_string(),
        ];
        let backends = backends_from_records(&payloads, &cfg);
        assert_eq!(backends.len(), 2);
        assert!(backends.iter().all(|b| b.kind() == "dynamic"));
    }
}
