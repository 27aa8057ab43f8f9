//! Censorship-circumvention HTTP/HTTPS proxy gateway.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sidestep::config::loader::load_config;
use sidestep::gateway::GatewayContext;
use sidestep::net::HostResolver;
use sidestep::observability::metrics;
use sidestep::observability::stat::TrafficLedger;
use sidestep::policy::us_ip::UsIpCache;
use sidestep::policy::HostPolicies;
use sidestep::registry::directory::load_directory;
use sidestep::registry::{GlobalFlags, ProxyRegistry};
use sidestep::{FrontDoor, GatewayConfig, Shutdown};

#[derive(Parser, Debug)]
#[command(name = "sidestep", about = "Forward proxy that dispatches across circumvention backends")]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sidestep=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("sidestep v0.1.0 starting");
    let args = Args::parse();

    // Create a default config if it doesn't exist (for easier first run)
    if !args.config.exists() {
        tracing::warn!(path = %args.config.display(), "config not found, creating default configuration");
        let default_config = GatewayConfig::default();
        std::fs::write(&args.config, toml::to_string_pretty(&default_config)?)?;
    }

    let config = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("failed to load configuration: {}. Exiting.", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        "configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "failed to parse metrics address"
            ),
        }
    }

    // The US-IP cache lives next to the config file.
    let us_ip_path = args
        .config
        .parent()
        .map(|dir| dir.join("us_ip"))
        .unwrap_or_else(|| PathBuf::from("us_ip"));

    let ledger = Arc::new(TrafficLedger::new());
    let resolver = Arc::new(HostResolver::new());
    let policies = Arc::new(HostPolicies::from_config(
        &config.policy,
        UsIpCache::new(Some(us_ip_path), None),
    ));
    let registry = Arc::new(ProxyRegistry::new(
        GlobalFlags::new(&config.flags, &config.public_servers),
        ledger.clone(),
        resolver.clone(),
    ));
    registry.init_from_config(&config.private_servers);

    let ctx = Arc::new(GatewayContext {
        registry: registry.clone(),
        policies: policies.clone(),
        resolver,
        ledger,
        timeouts: config.timeouts.clone(),
    });

    let shutdown = Shutdown::new();

    // Public backend discovery runs detached; sessions work off whatever
    // the pool holds at any moment.
    {
        let registry = registry.clone();
        let policies = policies.clone();
        let public_servers = config.public_servers.clone();
        tokio::spawn(async move {
            load_directory(&registry, &public_servers, &policies).await;
        });
    }

    if config.public_servers.refresh_interval_secs > 0 {
        let registry = registry.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let period = Duration::from_secs(config.public_servers.refresh_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.refresh().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                shutdown.trigger();
            }
        });
    }

    let front_door = FrontDoor::bind(&config.listener, ctx).await?;
    tracing::info!(address = %front_door.local_addr()?, "gateway listening");
    front_door.run(shutdown.subscribe()).await;

    policies.us_ip.save();
    tracing::info!("shutdown complete");
    Ok(())
}
