//! First-bytes protocol classification.
//!
//! # Responsibilities
//! - Classify peeked client bytes as HTTP / HTTPS / UNKNOWN
//! - Extract the destination host (Host header or TLS SNI)
//! - Apply the well-known-port heuristic when the bytes are inconclusive
//!
//! # Design Decisions
//! - Pure function of `(peeked_data, dst_port)`; callers own the socket wait
//! - SNI extraction is a heuristic byte scan, not a full ClientHello parser;
//!   it trades exactness for tolerance of truncated records

use std::fmt;

/// Application protocol inferred from the first bytes of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
    Unknown,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "HTTP"),
            Protocol::Https => write!(f, "HTTPS"),
            Protocol::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// TLS record versions accepted as "this is HTTPS": SSL 3.0, TLS 1.0, TLS 1.1.
/// Later versions still advertise one of these in the record layer.
const TLS_RECORD_VERSIONS: [u16; 3] = [0x0300, 0x0301, 0x0302];

/// Classify peeked bytes and extract the server name, if any.
///
/// Rules, first match wins:
/// 1. an HTTP `Host:` header is present → HTTP with that host,
/// 2. the buffer parses as a TLS record with a known version → HTTPS with
///    the heuristically-extracted SNI (possibly empty),
/// 3. otherwise UNKNOWN, refined by the destination port (80 → HTTP,
///    443 → HTTPS).
pub fn analyze(peeked_data: &[u8], dst_port: u16) -> (Protocol, String) {
    if let Some(host) = find_http_host(peeked_data) {
        return (Protocol::Http, host);
    }
    if is_tls_record(peeked_data) {
        let host = parse_sni_domain(peeked_data).unwrap_or_default();
        return (Protocol::Https, host);
    }
    match dst_port {
        80 => (Protocol::Http, String::new()),
        443 => (Protocol::Https, String::new()),
        _ => (Protocol::Unknown, String::new()),
    }
}

/// Scan for a `Host: <value>` header anywhere in the buffer.
fn find_http_host(data: &[u8]) -> Option<String> {
    const NEEDLE: &[u8] = b"Host: ";
    let start = data
        .windows(NEEDLE.len())
        .position(|w| w == NEEDLE)?
        + NEEDLE.len();
    let rest = &data[start..];
    let end = rest
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(rest.len());
    let host = String::from_utf8_lossy(&rest[..end]).trim().to_string();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Check whether the buffer starts with a complete TLS record of a known
/// version. A buffer shorter than the record header, or shorter than the
/// record it announces, is not classified.
fn is_tls_record(data: &[u8]) -> bool {
    if data.len() < 5 {
        return false;
    }
    let version = u16::from_be_bytes([data[1], data[2]]);
    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if data.len() - 5 < record_len {
        return false;
    }
    TLS_RECORD_VERSIONS.contains(&version)
}

fn is_domain_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_'
}

/// Extract the SNI from a ClientHello, quick and dirty: scan for
/// `\x00\x00 <len> <domain>` where the length byte equals the length of the
/// run of domain characters that follows, 4..=255 bytes long.
pub fn parse_sni_domain(data: &[u8]) -> Option<String> {
    let mut i = 0;
    while i + 3 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            let claimed = data[i + 2] as usize;
            let run = data[i + 3..]
                .iter()
                .take(255)
                .take_while(|&&b| is_domain_byte(b))
                .count();
            if (4..=255).contains(&run) && run == claimed {
                let domain = &data[i + 3..i + 3 + run];
                return Some(String::from_utf8_lossy(domain).trim().to_string());
            }
        }
        i += 1;
    }
    None
}
