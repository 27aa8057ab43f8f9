//! Configuration validation logic.

use crate::config::schema::{GatewayConfig, PrivateServerConfig};

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("validation error: {0}")]
pub struct ValidationError(pub String);

/// Validate a GatewayConfig for semantic correctness.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // 1. The front door must parse as a socket address.
    if config.listener.bind_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError(format!(
            "listener.bind_address '{}' is not a socket address",
            config.listener.bind_address
        )));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError(
            "listener.max_connections must be > 0".to_string(),
        ));
    }

    // 2. The directory source must exist while any public class is enabled.
    let public = &config.public_servers;
    if (public.goagent_enabled || public.ss_enabled) && public.source.trim().is_empty() {
        errors.push(ValidationError(
            "public_servers.source must be set while public servers are enabled".to_string(),
        ));
    }

    // 3. Private servers need plausible endpoints.
    for (id, server) in &config.private_servers {
        match server {
            PrivateServerConfig::Http { port, .. }
            | PrivateServerConfig::Ssh { port, .. }
            | PrivateServerConfig::Shadowsocks { port, .. }
            | PrivateServerConfig::Spdy { port, .. } => {
                if *port == 0 {
                    errors.push(ValidationError(format!(
                        "private_servers.{id}: port must be > 0"
                    )));
                }
            }
            PrivateServerConfig::GoAgent { appid, .. } => {
                if appid.trim().is_empty() {
                    errors.push(ValidationError(format!(
                        "private_servers.{id}: appid must not be empty"
                    )));
                }
            }
        }
    }

    // 4. Zeroed timeouts are almost certainly a mistake.
    if config.timeouts.connect_secs == 0 {
        tracing::warn!("timeouts.connect_secs is 0, upstreams will time out immediately");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
