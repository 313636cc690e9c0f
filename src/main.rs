//! Burrow relay server
//!
//! Exposes services running behind NAT on public subdomains. Tunnel clients
//! request a tunnel from the relay API, then dial a pool of plain TCP
//! connections to the port they are handed; public requests for
//! `<id>.<domain>` are forwarded over those connections.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use burrow_api::{ApiConfig, ApiServer};
use burrow_control::{RegistryConfig, TunnelRegistry};
use burrow_router::HostRouter;
use burrow_server_backend::BackendListenerConfig;
use burrow_server_http::{HttpServer, HttpServerConfig};

/// Tunnel relay - routes public HTTP traffic to tunnel clients
#[derive(Parser, Debug)]
#[command(name = "burrow-relay")]
#[command(about = "Run a burrow tunnel relay", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Args {
    /// Port for the public HTTP listener
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Address for the public HTTP listener
    #[arg(long, env = "ADDRESS", default_value = "0.0.0.0")]
    address: IpAddr,

    /// Advertise https tunnel URLs (TLS is terminated in front of the relay)
    #[arg(long, env = "SECURE")]
    secure: bool,

    /// Base domain of the relay (e.g. "relay.example.com")
    /// Without it, the tunnel id is everything left of the registrable domain
    #[arg(long, env = "DOMAIN")]
    domain: Option<String>,

    /// Backend connections each tunnel client may open
    #[arg(long, env = "MAX_SOCKETS", default_value_t = 10)]
    max_sockets: usize,

    /// Maximum number of live tunnels
    #[arg(long, env = "MAX_TUNNELS")]
    max_tunnels: Option<usize>,

    /// Maximum number of backend connections across all tunnels
    #[arg(long, env = "MAX_TOTAL_SOCKETS")]
    max_total_sockets: Option<usize>,

    /// Seconds a public request waits for a backend connection
    #[arg(long, default_value = "10", value_parser = parse_seconds)]
    acquire_timeout: Duration,

    /// Seconds a tunnel may sit without connections before it goes offline
    #[arg(long, default_value = "2", value_parser = parse_seconds)]
    offline_grace: Duration,

    /// Seconds an offline tunnel is kept before it is removed
    #[arg(long, default_value = "10", value_parser = parse_seconds)]
    removal_grace: Duration,

    /// Address the per-tunnel backend listeners bind to
    #[arg(long, env = "BACKEND_ADDRESS", default_value = "0.0.0.0")]
    backend_address: IpAddr,

    /// Where requests for the relay root are redirected
    #[arg(long, default_value = "https://localtunnel.github.io/www/")]
    landing: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|e| format!("invalid number of seconds '{}': {}", value, e))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration '{}': {}", value, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("Starting burrow relay {}", env!("GIT_TAG"));

    let registry_config = RegistryConfig::new()
        .with_max_sockets(args.max_sockets)
        .with_max_tunnels(args.max_tunnels)
        .with_max_total_sockets(args.max_total_sockets)
        .with_acquire_timeout(args.acquire_timeout)
        .with_offline_grace(args.offline_grace)
        .with_removal_grace(args.removal_grace);

    let registry = Arc::new(TunnelRegistry::new(registry_config));
    let sweeper = registry.spawn_sweeper();

    let api = ApiServer::new(
        ApiConfig {
            secure: args.secure,
            landing: args.landing.clone(),
            version: env!("GIT_TAG").to_string(),
        },
        registry.clone(),
        BackendListenerConfig {
            bind_ip: args.backend_address,
        },
    );

    let bind_addr = SocketAddr::new(args.address, args.port);
    let server = HttpServer::new(HttpServerConfig { bind_addr }, registry.clone())
        .with_router(HostRouter::new(args.domain.clone()))
        .with_api(api.build_router());

    let mut http_handle = tokio::spawn(async move { server.start().await });

    info!("Relay is running");
    info!("  - Public HTTP: {}", bind_addr);
    match &args.domain {
        Some(domain) => info!("  - Tunnel URLs: <id>.{}", domain),
        None => info!("  - Tunnel URLs: <id>.<registrable domain of the request>"),
    }
    info!("  - Max sockets per tunnel: {}", args.max_sockets);
    info!("Press Ctrl+C to stop");

    tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received, stopping relay..."),
                Err(err) => error!("Error listening for shutdown signal: {}", err),
            }
            http_handle.abort();
        }
        result = &mut http_handle => {
            sweeper.abort();
            registry.shutdown();
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e).context("HTTP server failed"),
                Err(e) => Err(e).context("HTTP server task panicked"),
            };
        }
    }

    sweeper.abort();
    registry.shutdown();
    info!("Relay stopped");

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_seconds("0.5").unwrap(), Duration::from_millis(500));
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("soon").is_err());
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["burrow-relay"]).unwrap();
        assert_eq!(args.max_sockets, 10);
        assert_eq!(args.acquire_timeout, Duration::from_secs(10));
        assert_eq!(args.offline_grace, Duration::from_secs(2));
        assert!(args.domain.is_none());
    }
}
