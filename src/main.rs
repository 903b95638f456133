//! wstun
//!
//! Layer-3 tunnel client: routes the host's IPv4 traffic through a TUN
//! device and relays each packet as a binary WebSocket frame.
//!
//! Usage:
//!   wstun relay.example.com:443 --client-id <UUID>
//!   wstun relay.example.com:443 -c ~/.config/wstun/client.toml
//!   wstun 192.0.2.10:8080 --tls disabled --no-default-routes

#[cfg(not(unix))]
compile_error!("wstun only supports Linux and macOS");

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use wstun::config::{expand_tilde, load_config, parse_relay_target, ClientConfig, Overrides};
use wstun::device::TunDevice;
use wstun::dialer::TlsPolicy;
use wstun::lock::TunnelLock;
use wstun::route::{self, HostRouteGuard, RouteGuard};
use wstun::{Supervisor, WsDialer};

#[derive(Parser)]
#[command(name = "wstun")]
#[command(version)]
#[command(about = "Layer-3 tunnel over TLS WebSocket")]
struct Args {
    /// Relay address (host:port or [v6]:port)
    target: Option<String>,

    /// Config file (default: ~/.config/wstun/client.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Client UUID sent in the session handshake
    #[arg(long)]
    client_id: Option<Uuid>,

    /// TLS mode for the relay connection
    #[arg(long, value_enum)]
    tls: Option<TlsPolicy>,

    /// Wait for one frame from the relay before relaying packets
    #[arg(long)]
    await_ack: bool,

    /// TUN interface name
    #[arg(long)]
    tun_name: Option<String>,

    /// TUN MTU (valid range: 576-1500)
    #[arg(long, value_parser = clap::value_parser!(u16).range(576..=1500))]
    mtu: Option<u16>,

    /// Gateway for the relay host route (default: current route to the relay)
    #[arg(long)]
    gateway: Option<IpAddr>,

    /// Leave the default route alone; only the TUN device is brought up
    #[arg(long)]
    no_default_routes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let Some(target) = args.target.as_deref() else {
        log::error!("Missing relay address. Usage: wstun <host:port> [OPTIONS]");
        std::process::exit(1);
    };
    let (host, port) = parse_relay_target(target)?;

    let config_path = args.config.as_ref().map(|p| expand_tilde(p));
    let mut config = load_config(config_path.as_deref())?;
    config.apply_overrides(Overrides {
        client_id: args.client_id,
        tls: args.tls,
        await_ack: args.await_ack,
        tun_name: args.tun_name,
        mtu: args.mtu,
        gateway: args.gateway,
        no_default_routes: args.no_default_routes,
    });
    config.validate()?;

    run_client(&config, &host, port).await
}

/// Set up the host, then supervise sessions until SIGINT or SIGTERM.
async fn run_client(config: &ClientConfig, host: &str, port: u16) -> Result<()> {
    let _lock = TunnelLock::acquire()?;

    let dialer_config = config.dialer_config(host, port)?;
    log::info!("Relay: {}", dialer_config.url());

    // The relay must stay reachable outside the tunnel once the split
    // default route is installed.
    let host_route: Option<HostRouteGuard> = if config.routes.default_routes {
        let relay_ip = resolve_relay_ip(host, port).await?;
        log::info!("Resolved relay {} to {}", host, relay_ip);
        let guard =
            route::add_host_route(relay_ip, config.routes.gateway, Some(&config.tunnel.name))
                .await?;
        Some(guard)
    } else {
        None
    };

    let device = Arc::new(TunDevice::create(config.tun_config())?);

    let routes: Option<RouteGuard> = if config.routes.default_routes {
        Some(route::add_default_routes(device.name(), config.routes.metric).await?)
    } else {
        log::info!("Default routes disabled; traffic enters the tunnel only via explicit routes");
        None
    };

    let supervisor = Supervisor::new(
        WsDialer::new(dialer_config),
        device.clone(),
        config.relay_options(),
        config.backoff_strategy(),
    );

    let cancel = CancellationToken::new();
    let signal_task = tokio::spawn(cancel_on_signal(cancel.clone()));

    supervisor.run(cancel).await;
    signal_task.abort();

    let relay_stats = supervisor.relay_stats();
    log::info!(
        "Tunnel stopped. {}; sent {} packets ({} bytes), received {} packets ({} bytes)",
        supervisor.stats().snapshot(),
        relay_stats.packets_to_transport.load(Ordering::Relaxed),
        relay_stats.bytes_to_transport.load(Ordering::Relaxed),
        relay_stats.packets_to_device.load(Ordering::Relaxed),
        relay_stats.bytes_to_device.load(Ordering::Relaxed),
    );

    // Routes go before the device, then the relay host route, then the lock.
    drop(supervisor);
    drop(routes);
    drop(device);
    drop(host_route);
    Ok(())
}

/// First address for the relay, IPv4 preferred.
async fn resolve_relay_ip(host: &str, port: u16) -> Result<IpAddr> {
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve relay host '{}'", host))?
        .map(|addr| addr.ip())
        .collect();
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .with_context(|| format!("Relay host '{}' resolved to no addresses", host))
}

async fn cancel_on_signal(cancel: CancellationToken) {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(e) => {
            log::warn!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                log::warn!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            log::info!("Received Ctrl+C, shutting down...");
        }
        Some(_) = async {
            match sigterm.as_mut() {
                Some(sigterm) => sigterm.recv().await,
                None => std::future::pending().await,
            }
        } => {
            log::info!("Received SIGTERM, shutting down...");
        }
    }
    cancel.cancel();
}
