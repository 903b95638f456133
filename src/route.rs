//! Routing table changes for the tunnel.
//!
//! Two kinds of routes are installed, each owned by a guard that removes it
//! on drop:
//! - a host route pinning the relay's address to the physical uplink, so the
//!   transport's own traffic never enters the tunnel;
//! - the split default route (`0.0.0.0/1` + `128.0.0.0/1`) through the TUN
//!   device, which overrides the existing default route without deleting it.
//!
//! The host route must be in place before the split routes.

use crate::error::{SetupError, SetupResult};
use ipnet::Ipv4Net;
use std::net::{IpAddr, Ipv4Addr};
use tokio::process::Command;

/// The two halves of the IPv4 default route.
pub fn split_default_routes() -> [Ipv4Net; 2] {
    [
        Ipv4Net::new_assert(Ipv4Addr::UNSPECIFIED, 1),
        Ipv4Net::new_assert(Ipv4Addr::new(128, 0, 0, 0), 1),
    ]
}

/// Check if an error message indicates that a resource already exists.
///
/// - Linux iproute2: "RTNETLINK answers: File exists"
/// - macOS route: "route: writing to routing socket: File exists"
fn is_already_exists_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("file exists") || lower.contains("eexist")
}

fn command_args(args: &[String]) -> Vec<&str> {
    args.iter().map(|s| s.as_str()).collect()
}

// ============================================================================
// Tunnel routes
// ============================================================================

#[cfg(target_os = "linux")]
fn linux_route_args(op: &str, route: &Ipv4Net, tun_name: &str, metric: u32) -> Vec<String> {
    vec![
        "route".into(),
        op.into(),
        route.to_string(),
        "dev".into(),
        tun_name.into(),
        "metric".into(),
        metric.to_string(),
    ]
}

#[cfg(target_os = "macos")]
fn macos_route_args(op: &str, route: &Ipv4Net, tun_name: &str) -> Vec<String> {
    vec![
        op.into(),
        "-net".into(),
        route.network().to_string(),
        "-netmask".into(),
        route.netmask().to_string(),
        "-interface".into(),
        tun_name.into(),
    ]
}

/// Add one route through the TUN device. An existing identical route counts
/// as success.
async fn add_route(tun_name: &str, route: &Ipv4Net, metric: u32) -> SetupResult<()> {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        #[cfg(target_os = "linux")]
        let (program, args) = ("ip", linux_route_args("add", route, tun_name, metric));
        #[cfg(target_os = "macos")]
        let (program, args) = {
            let _ = metric;
            ("route", macos_route_args("add", route, tun_name))
        };

        let output = Command::new(program)
            .args(command_args(&args))
            .output()
            .await
            .map_err(|e| SetupError::route_with_source("Failed to execute route command", e))?;

        if output.status.success() {
            log::info!("Added route {} via {}", route, tun_name);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_already_exists_error(&stderr) {
            log::warn!(
                "Route {} already exists (treating as success): {}",
                route,
                stderr.trim()
            );
            return Ok(());
        }
        Err(SetupError::route(format!(
            "Failed to add route {}: {}",
            route,
            stderr.trim()
        )))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = (tun_name, route, metric);
        Err(SetupError::route(
            "Route management not supported on this platform",
        ))
    }
}

/// Remove a route (blocking, best-effort; used from `Drop`).
fn remove_route_sync(tun_name: &str, route: &Ipv4Net, metric: u32) {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        #[cfg(target_os = "linux")]
        let (program, args) = ("ip", linux_route_args("del", route, tun_name, metric));
        #[cfg(target_os = "macos")]
        let (program, args) = {
            let _ = metric;
            ("route", macos_route_args("delete", route, tun_name))
        };

        match std::process::Command::new(program)
            .args(command_args(&args))
            .output()
        {
            Ok(output) if output.status.success() => {
                log::info!("Removed route {} via {}", route, tun_name);
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                log::warn!("Failed to remove route {}: {}", route, stderr.trim());
            }
            Err(e) => {
                log::warn!("Failed to execute route delete command: {}", e);
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = (tun_name, route, metric);
    }
}

/// Install the split default route through `tun_name`.
///
/// If the second half fails, the first is rolled back.
pub async fn add_default_routes(tun_name: &str, metric: u32) -> SetupResult<RouteGuard> {
    let routes = split_default_routes();
    let mut added: Vec<Ipv4Net> = Vec::with_capacity(routes.len());

    for route in &routes {
        if let Err(e) = add_route(tun_name, route, metric).await {
            log::warn!(
                "Failed to add route {}, rolling back {} route(s)",
                route,
                added.len()
            );
            for added_route in added.iter().rev() {
                remove_route_sync(tun_name, added_route, metric);
            }
            return Err(e);
        }
        added.push(*route);
    }

    Ok(RouteGuard {
        tun_name: tun_name.to_string(),
        routes: added,
        metric,
    })
}

/// Removes tunnel routes when dropped.
pub struct RouteGuard {
    tun_name: String,
    routes: Vec<Ipv4Net>,
    metric: u32,
}

impl RouteGuard {
    pub fn routes(&self) -> &[Ipv4Net] {
        &self.routes
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        if self.routes.is_empty() {
            return;
        }
        log::info!(
            "Cleaning up {} route(s) via {}",
            self.routes.len(),
            self.tun_name
        );
        for route in self.routes.iter().rev() {
            remove_route_sync(&self.tun_name, route, self.metric);
        }
    }
}

// ============================================================================
// Relay host route
// ============================================================================

/// Where traffic to the relay currently leaves the host.
#[derive(Debug, Clone, PartialEq, Eq)]
struct UplinkRoute {
    device: Option<String>,
    gateway: Option<IpAddr>,
    /// Raw gateway with scope ID preserved (e.g. "fe80::1%en0").
    gateway_str: Option<String>,
}

/// Validate that a gateway string contains only address characters and an
/// optional `%scope` suffix. Route command output is untrusted input.
#[cfg_attr(not(any(target_os = "linux", target_os = "macos")), allow(dead_code))]
fn is_valid_gateway_str(s: &str) -> bool {
    let (addr_part, scope_part) = match s.split_once('%') {
        Some((addr, scope)) => (addr, Some(scope)),
        None => (s, None),
    };
    if addr_part.is_empty()
        || !addr_part
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.')
    {
        return false;
    }
    match scope_part {
        Some(scope) => {
            !scope.is_empty()
                && scope
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        None => true,
    }
}

/// Parse `ip route get` output, e.g.
/// `203.0.113.9 via 192.168.8.1 dev usb0 src 192.168.8.100 uid 0`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_linux_route_get(output: &str, host: IpAddr) -> SetupResult<UplinkRoute> {
    let mut device = None;
    let mut gateway = None;
    let mut gateway_str = None;

    let tokens: Vec<&str> = output.split_whitespace().collect();
    for pair in tokens.windows(2) {
        match pair[0] {
            "dev" => device = Some(pair[1].to_string()),
            "via" if is_valid_gateway_str(pair[1]) => {
                gateway_str = Some(pair[1].to_string());
                gateway = pair[1].parse().ok();
            }
            "via" => log::debug!("Ignoring malformed gateway in route output: {:?}", pair[1]),
            _ => {}
        }
    }

    let device = device.ok_or_else(|| {
        SetupError::route(format!("Could not determine device for route to {}", host))
    })?;
    Ok(UplinkRoute {
        device: Some(device),
        gateway,
        gateway_str,
    })
}

/// Parse `route get` output on macOS:
///
/// ```text
///    route to: 203.0.113.9
/// destination: default
///     gateway: 192.168.8.1
///   interface: en0
/// ```
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_macos_route_get(output: &str, host: IpAddr) -> SetupResult<UplinkRoute> {
    let mut device = None;
    let mut gateway = None;
    let mut gateway_str = None;

    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("interface:") {
            device = Some(rest.trim().to_string());
        }
        if let Some(rest) = line.strip_prefix("gateway:") {
            let gw = rest.trim();
            if is_valid_gateway_str(gw) {
                gateway_str = Some(gw.to_string());
                gateway = gw.split('%').next().and_then(|g| g.parse().ok());
            } else {
                log::debug!("Ignoring malformed gateway in route output: {:?}", gw);
            }
        }
    }

    let device = device.ok_or_else(|| {
        SetupError::route(format!(
            "Could not determine interface for route to {}",
            host
        ))
    })?;
    Ok(UplinkRoute {
        device: Some(device),
        gateway,
        gateway_str,
    })
}

/// Ask the OS how it currently reaches `host`.
#[cfg(any(target_os = "linux", target_os = "macos"))]
async fn query_route(host: IpAddr) -> SetupResult<UplinkRoute> {
    let host_str = host.to_string();

    #[cfg(target_os = "linux")]
    let (program, args): (&str, Vec<&str>) = if host.is_ipv4() {
        ("ip", vec!["route", "get", &host_str])
    } else {
        ("ip", vec!["-6", "route", "get", &host_str])
    };
    #[cfg(target_os = "macos")]
    let (program, args): (&str, Vec<&str>) = if host.is_ipv4() {
        ("route", vec!["get", &host_str])
    } else {
        ("route", vec!["get", "-inet6", &host_str])
    };

    let output = Command::new(program)
        .args(&args)
        .output()
        .await
        .map_err(|e| SetupError::route_with_source("Failed to query route", e))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SetupError::route(format!(
            "Failed to query route for {}: {}",
            host,
            stderr.trim()
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);

    #[cfg(target_os = "linux")]
    {
        parse_linux_route_get(&stdout, host)
    }
    #[cfg(target_os = "macos")]
    {
        parse_macos_route_get(&stdout, host)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn query_route(_host: IpAddr) -> SetupResult<UplinkRoute> {
    Err(SetupError::route(
        "Route lookup not supported on this platform",
    ))
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn linux_host_route_args(op: &str, host: IpAddr, uplink: &UplinkRoute) -> Vec<String> {
    let prefix = if host.is_ipv4() { 32 } else { 128 };
    let mut args: Vec<String> = Vec::new();
    if host.is_ipv6() {
        args.push("-6".into());
    }
    args.extend(["route".into(), op.into(), format!("{}/{}", host, prefix)]);
    if let Some(gw) = uplink.gateway {
        args.extend(["via".into(), gw.to_string()]);
    }
    if let Some(ref device) = uplink.device {
        args.extend(["dev".into(), device.clone()]);
    }
    args
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn macos_host_route_args(op: &str, host: IpAddr, uplink: &UplinkRoute) -> Vec<String> {
    let mut args: Vec<String> = vec![op.into()];
    if host.is_ipv6() {
        args.push("-inet6".into());
    }
    args.extend(["-host".into(), host.to_string()]);
    match (&uplink.gateway_str, &uplink.device) {
        (Some(gw), _) => args.push(gw.clone()),
        (None, Some(device)) => args.extend(["-interface".into(), device.clone()]),
        (None, None) => {}
    }
    args
}

/// Pin traffic for `host` to the current uplink.
///
/// With an explicit `gateway` the route goes via that gateway. Otherwise the
/// OS route lookup decides; a lookup that resolves through
/// `disallow_device` (the tunnel) is refused.
pub async fn add_host_route(
    host: IpAddr,
    gateway: Option<IpAddr>,
    disallow_device: Option<&str>,
) -> SetupResult<HostRouteGuard> {
    let uplink = match gateway {
        Some(gw) => UplinkRoute {
            device: None,
            gateway: Some(gw),
            gateway_str: Some(gw.to_string()),
        },
        None => query_route(host).await?,
    };

    if let (Some(disallowed), Some(device)) = (disallow_device, uplink.device.as_deref()) {
        if device == disallowed {
            return Err(SetupError::route(format!(
                "Refusing host route for {}: lookup resolved via tunnel interface {}",
                host, disallowed
            )));
        }
    }

    log::info!(
        "Adding host route for relay {} (device: {:?}, gateway: {:?})",
        host,
        uplink.device,
        uplink.gateway
    );

    install_host_route(host, &uplink).await?;
    Ok(HostRouteGuard { host, uplink })
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
async fn install_host_route(host: IpAddr, uplink: &UplinkRoute) -> SetupResult<()> {
    #[cfg(target_os = "linux")]
    let (program, args) = ("ip", linux_host_route_args("add", host, uplink));
    #[cfg(target_os = "macos")]
    let (program, args) = ("route", macos_host_route_args("add", host, uplink));

    let output = Command::new(program)
        .args(command_args(&args))
        .output()
        .await
        .map_err(|e| SetupError::route_with_source("Failed to add host route", e))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_already_exists_error(&stderr) {
        log::warn!(
            "Host route for {} already exists (treating as success)",
            host
        );
        return Ok(());
    }
    Err(SetupError::route(format!(
        "Failed to add host route for {}: {}",
        host,
        stderr.trim()
    )))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn install_host_route(_host: IpAddr, _uplink: &UplinkRoute) -> SetupResult<()> {
    Err(SetupError::route(
        "Host route not supported on this platform",
    ))
}

/// Removes the relay host route when dropped.
pub struct HostRouteGuard {
    host: IpAddr,
    uplink: UplinkRoute,
}

impl HostRouteGuard {
    pub fn host(&self) -> IpAddr {
        self.host
    }
}

impl Drop for HostRouteGuard {
    fn drop(&mut self) {
        log::info!("Removing host route for {}", self.host);

        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            #[cfg(target_os = "linux")]
            let (program, args) = ("ip", linux_host_route_args("del", self.host, &self.uplink));
            #[cfg(target_os = "macos")]
            let (program, args) = (
                "route",
                macos_host_route_args("delete", self.host, &self.uplink),
            );

            match std::process::Command::new(program)
                .args(command_args(&args))
                .output()
            {
                Ok(output) if output.status.success() => {
                    log::info!("Removed host route for {}", self.host);
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    log::warn!(
                        "Failed to remove host route for {}: {}",
                        self.host,
                        stderr.trim()
                    );
                }
                Err(e) => log::warn!("Failed to execute route delete: {}", e),
            }
        }
    }
}
