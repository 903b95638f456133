//! Client configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, an
//! optional TOML file, then command-line overrides. [`ClientConfig::validate`]
//! runs last.
//!
//! ```toml
//! [relay]
//! path = "/tun"
//! client_id = "d43308ce-0cab-469d-8f4e-87c5a9d8e2bf"
//! tls = "verify"            # verify | skip-verification | disabled
//! ack = "none"              # none | await-frame
//!
//! [tunnel]
//! name = "tun-l3"
//! address = "10.50.0.2/24"
//! mtu = 1500
//!
//! [routes]
//! default_routes = true
//! gateway = "192.168.8.1"
//!
//! [backoff]
//! strategy = "fixed"
//! delay_ms = 5000
//! ```

use crate::backoff::{BackoffStrategy, ExponentialBackoff, FixedBackoff};
use crate::device::TunConfig;
use crate::dialer::{AckPolicy, DialerConfig, TlsPolicy, DEFAULT_PATH, DEFAULT_USER_AGENT};
use crate::handshake::HandshakeMode;
use crate::relay::{RelayOptions, DEFAULT_BUFFER_SIZE};
use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_TUN_NAME: &str = "tun-l3";
pub const DEFAULT_TUN_ADDRESS: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(10, 50, 0, 2), 24);
pub const DEFAULT_MTU: u16 = 1500;
pub const DEFAULT_ROUTE_METRIC: u32 = 100;
pub const DEFAULT_BACKOFF_MS: u64 = 5000;

/// Longest interface name the kernel accepts.
const MAX_IFNAME_LEN: usize = 15;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelaySection {
    pub path: String,
    pub user_agent: String,
    pub client_id: Option<Uuid>,
    pub handshake: HandshakeMode,
    pub tls: TlsPolicy,
    pub ack: AckPolicy,
    pub dial_timeout_secs: u64,
    pub ack_timeout_secs: u64,
    /// Keepalive period; no keepalives when unset.
    pub keepalive_secs: Option<u64>,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            path: DEFAULT_PATH.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            client_id: None,
            handshake: HandshakeMode::Canonical,
            tls: TlsPolicy::Verify,
            ack: AckPolicy::None,
            dial_timeout_secs: 10,
            ack_timeout_secs: 10,
            keepalive_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelSection {
    pub name: String,
    pub address: Ipv4Net,
    pub mtu: u16,
    pub buffer_size: usize,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            name: DEFAULT_TUN_NAME.to_string(),
            address: DEFAULT_TUN_ADDRESS,
            mtu: DEFAULT_MTU,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutesSection {
    /// Install `0.0.0.0/1` and `128.0.0.0/1` through the tunnel.
    pub default_routes: bool,
    /// Gateway for the relay host route. Looked up from the current routing
    /// table when unset.
    pub gateway: Option<IpAddr>,
    pub metric: u32,
}

impl Default for RoutesSection {
    fn default() -> Self {
        Self {
            default_routes: true,
            gateway: None,
            metric: DEFAULT_ROUTE_METRIC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum BackoffSection {
    Fixed {
        #[serde(default = "default_backoff_ms")]
        delay_ms: u64,
    },
    Exponential {
        #[serde(default = "default_exp_base_ms")]
        base_ms: u64,
        #[serde(default = "default_exp_max_ms")]
        max_ms: u64,
        #[serde(default = "default_exp_jitter_ms")]
        jitter_ms: u64,
    },
}

fn default_backoff_ms() -> u64 {
    DEFAULT_BACKOFF_MS
}

fn default_exp_base_ms() -> u64 {
    1000
}

fn default_exp_max_ms() -> u64 {
    60_000
}

fn default_exp_jitter_ms() -> u64 {
    500
}

impl Default for BackoffSection {
    fn default() -> Self {
        BackoffSection::Fixed {
            delay_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub relay: RelaySection,
    pub tunnel: TunnelSection,
    pub routes: RoutesSection,
    pub backoff: BackoffSection,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub client_id: Option<Uuid>,
    pub tls: Option<TlsPolicy>,
    pub await_ack: bool,
    pub tun_name: Option<String>,
    pub mtu: Option<u16>,
    pub gateway: Option<IpAddr>,
    pub no_default_routes: bool,
}

impl ClientConfig {
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if overrides.client_id.is_some() {
            self.relay.client_id = overrides.client_id;
        }
        if let Some(tls) = overrides.tls {
            self.relay.tls = tls;
        }
        if overrides.await_ack {
            self.relay.ack = AckPolicy::AwaitFrame;
        }
        if let Some(name) = overrides.tun_name {
            self.tunnel.name = name;
        }
        if let Some(mtu) = overrides.mtu {
            self.tunnel.mtu = mtu;
        }
        if overrides.gateway.is_some() {
            self.routes.gateway = overrides.gateway;
        }
        if overrides.no_default_routes {
            self.routes.default_routes = false;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let relay = &self.relay;
        if !relay.path.starts_with('/') {
            anyhow::bail!("[relay] path '{}' must start with '/'", relay.path);
        }
        if relay.user_agent.trim().is_empty() {
            anyhow::bail!("[relay] user_agent must not be empty");
        }
        if relay.client_id.is_none() {
            anyhow::bail!(
                "[relay] client_id is required. Set it in the config file or pass --client-id."
            );
        }
        if relay.dial_timeout_secs == 0 {
            anyhow::bail!("[relay] dial_timeout_secs must be at least 1");
        }
        if relay.ack == AckPolicy::AwaitFrame && relay.ack_timeout_secs == 0 {
            anyhow::bail!("[relay] ack_timeout_secs must be at least 1");
        }
        if relay.keepalive_secs == Some(0) {
            anyhow::bail!("[relay] keepalive_secs must be at least 1 when set");
        }

        let tunnel = &self.tunnel;
        if tunnel.name.is_empty() || tunnel.name.len() > MAX_IFNAME_LEN {
            anyhow::bail!(
                "[tunnel] name '{}' must be 1-{} characters",
                tunnel.name,
                MAX_IFNAME_LEN
            );
        }
        if !(576..=1500).contains(&tunnel.mtu) {
            anyhow::bail!(
                "[tunnel] MTU {} is out of range. Valid range: 576-1500",
                tunnel.mtu
            );
        }
        if tunnel.buffer_size < tunnel.mtu as usize {
            anyhow::bail!(
                "[tunnel] buffer_size {} is smaller than MTU {}",
                tunnel.buffer_size,
                tunnel.mtu
            );
        }

        match self.backoff {
            BackoffSection::Fixed { delay_ms } => {
                if delay_ms == 0 {
                    anyhow::bail!("[backoff] delay_ms must be at least 1");
                }
            }
            BackoffSection::Exponential { base_ms, max_ms, .. } => {
                if base_ms == 0 {
                    anyhow::bail!("[backoff] base_ms must be at least 1");
                }
                if max_ms < base_ms {
                    anyhow::bail!(
                        "[backoff] max_ms {} is smaller than base_ms {}",
                        max_ms,
                        base_ms
                    );
                }
            }
        }
        Ok(())
    }

    /// Dialer settings for `host:port`. Call after [`ClientConfig::validate`].
    pub fn dialer_config(&self, host: &str, port: u16) -> Result<DialerConfig> {
        let client_id = self
            .relay
            .client_id
            .context("[relay] client_id is required")?;
        let mut config = DialerConfig::new(host, port, client_id, self.relay.tls);
        config.path = self.relay.path.clone();
        config.user_agent = self.relay.user_agent.clone();
        config.handshake_mode = self.relay.handshake;
        config.ack_policy = self.relay.ack;
        config.dial_timeout = Duration::from_secs(self.relay.dial_timeout_secs);
        config.ack_timeout = Duration::from_secs(self.relay.ack_timeout_secs);
        Ok(config)
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            buffer_size: self.tunnel.buffer_size,
            keepalive_interval: self.relay.keepalive_secs.map(Duration::from_secs),
        }
    }

    pub fn backoff_strategy(&self) -> Box<dyn BackoffStrategy> {
        match self.backoff {
            BackoffSection::Fixed { delay_ms } => {
                Box::new(FixedBackoff(Duration::from_millis(delay_ms)))
            }
            BackoffSection::Exponential {
                base_ms,
                max_ms,
                jitter_ms,
            } => Box::new(ExponentialBackoff {
                base: Duration::from_millis(base_ms),
                max: Duration::from_millis(max_ms),
                jitter: Duration::from_millis(jitter_ms),
            }),
        }
    }

    pub fn tun_config(&self) -> TunConfig {
        TunConfig::new(self.tunnel.address)
            .with_name(self.tunnel.name.clone())
            .with_mtu(self.tunnel.mtu)
    }
}

/// Split `host:port` or `[v6]:port`.
pub fn parse_relay_target(target: &str) -> Result<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .with_context(|| format!("Relay target '{}' must be host:port", target))?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .with_context(|| format!("Unterminated IPv6 literal in '{}'", target))?,
        None if host.contains(':') => {
            anyhow::bail!("IPv6 relay address '{}' must be bracketed: [addr]:port", target)
        }
        None => host,
    };
    if host.is_empty() {
        anyhow::bail!("Relay target '{}' has an empty host", target);
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid port in relay target '{}'", target))?;
    if port == 0 {
        anyhow::bail!("Relay target '{}' has port 0", target);
    }
    Ok((host.to_string(), port))
}

pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    path.to_path_buf()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("wstun").join("client.toml"))
}

pub fn parse_config(content: &str) -> Result<ClientConfig> {
    toml::from_str(content).context("Failed to parse client config")
}

/// Load from `path`, or from the default location when it exists.
/// Returns defaults when no path is given and no default file is present.
pub fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    let config_path = match path {
        Some(p) => expand_tilde(p),
        None => match default_config_path() {
            Some(p) if p.exists() => p,
            _ => return Ok(ClientConfig::default()),
        },
    };
    let content = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", config_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_ID: &str = "d43308ce-0cab-469d-8f4e-87c5a9d8e2bf";

    fn with_client_id(mut config: ClientConfig) -> ClientConfig {
        config.relay.client_id = Some(CLIENT_ID.parse().expect("uuid"));
        config
    }

    #[test]
    fn test_defaults_match_observed_client() {
        let config = ClientConfig::default();
        assert_eq!(config.relay.path, "/tun");
        assert_eq!(config.relay.user_agent, "Mozilla/5.0 (Linux; Android)");
        assert_eq!(config.relay.tls, TlsPolicy::Verify);
        assert_eq!(config.relay.ack, AckPolicy::None);
        assert_eq!(config.tunnel.name, "tun-l3");
        assert_eq!(config.tunnel.address.to_string(), "10.50.0.2/24");
        assert_eq!(config.tunnel.mtu, 1500);
        assert_eq!(config.tunnel.buffer_size, 2048);
        assert_eq!(config.backoff, BackoffSection::Fixed { delay_ms: 5000 });
        assert!(config.routes.default_routes);
    }

    #[test]
    fn test_default_requires_client_id() {
        let err = ClientConfig::default().validate().expect_err("missing id");
        assert!(err.to_string().contains("client_id"));
        with_client_id(ClientConfig::default())
            .validate()
            .expect("defaults plus id are valid");
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse_config(
            r#"
            [relay]
            path = "/vless"
            client_id = "d43308ce-0cab-469d-8f4e-87c5a9d8e2bf"
            handshake = "id-only"
            tls = "skip-verification"
            ack = "await-frame"
            keepalive_secs = 25

            [tunnel]
            name = "tun-e3372h"
            address = "10.60.0.2/16"
            mtu = 1400

            [routes]
            default_routes = false
            gateway = "192.168.8.1"

            [backoff]
            strategy = "exponential"
            base_ms = 500
            "#,
        )
        .expect("parse config");
        config.validate().expect("valid config");

        assert_eq!(config.relay.path, "/vless");
        assert_eq!(config.relay.handshake, HandshakeMode::IdOnly);
        assert_eq!(config.relay.tls, TlsPolicy::SkipVerification);
        assert_eq!(config.relay.ack, AckPolicy::AwaitFrame);
        assert_eq!(config.tunnel.name, "tun-e3372h");
        assert_eq!(config.tunnel.mtu, 1400);
        assert!(!config.routes.default_routes);
        assert_eq!(
            config.routes.gateway,
            Some("192.168.8.1".parse().expect("ip"))
        );
        assert_eq!(
            config.backoff,
            BackoffSection::Exponential {
                base_ms: 500,
                max_ms: 60_000,
                jitter_ms: 500
            }
        );

        let dialer = config.dialer_config("relay.example", 443).expect("dialer");
        assert_eq!(dialer.url(), "wss://relay.example:443/vless");
        assert_eq!(dialer.ack_policy, AckPolicy::AwaitFrame);
        assert_eq!(
            config.relay_options().keepalive_interval,
            Some(Duration::from_secs(25))
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(parse_config("[relay]\npaht = \"/tun\"\n").is_err());
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = with_client_id(ClientConfig::default());
        config.apply_overrides(Overrides {
            tls: Some(TlsPolicy::Disabled),
            await_ack: true,
            tun_name: Some("tun9".to_string()),
            mtu: Some(1280),
            no_default_routes: true,
            ..Overrides::default()
        });
        assert_eq!(config.relay.tls, TlsPolicy::Disabled);
        assert_eq!(config.relay.ack, AckPolicy::AwaitFrame);
        assert_eq!(config.tunnel.name, "tun9");
        assert_eq!(config.tun_config().mtu, 1280);
        assert!(!config.routes.default_routes);
        config.validate().expect("valid");
    }

    #[test]
    fn test_validation_errors() {
        let mut config = with_client_id(ClientConfig::default());
        config.tunnel.mtu = 9000;
        assert!(config.validate().is_err());

        let mut config = with_client_id(ClientConfig::default());
        config.tunnel.buffer_size = 1000;
        assert!(config.validate().is_err());

        let mut config = with_client_id(ClientConfig::default());
        config.relay.path = "tun".to_string();
        assert!(config.validate().is_err());

        let mut config = with_client_id(ClientConfig::default());
        config.tunnel.name = "a-very-long-interface-name".to_string();
        assert!(config.validate().is_err());

        let mut config = with_client_id(ClientConfig::default());
        config.backoff = BackoffSection::Fixed { delay_ms: 0 };
        assert!(config.validate().is_err());

        let mut config = with_client_id(ClientConfig::default());
        config.backoff = BackoffSection::Exponential {
            base_ms: 2000,
            max_ms: 1000,
            jitter_ms: 0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_strategy_from_config() {
        let config = ClientConfig::default();
        assert_eq!(config.backoff_strategy().next(3), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_relay_target() {
        assert_eq!(
            parse_relay_target("relay.example:443").expect("parse"),
            ("relay.example".to_string(), 443)
        );
        assert_eq!(
            parse_relay_target("203.0.113.9:8443").expect("parse"),
            ("203.0.113.9".to_string(), 8443)
        );
        assert_eq!(
            parse_relay_target("[2001:db8::1]:443").expect("parse"),
            ("2001:db8::1".to_string(), 443)
        );
        assert!(parse_relay_target("relay.example").is_err());
        assert!(parse_relay_target(":443").is_err());
        assert!(parse_relay_target("relay.example:0").is_err());
        assert!(parse_relay_target("relay.example:https").is_err());
        assert!(parse_relay_target("2001:db8::1:443").is_err());
        assert!(parse_relay_target("[2001:db8::1:443").is_err());
    }

    #[test]
    fn test_expand_tilde() {
        let plain = Path::new("/etc/wstun/client.toml");
        assert_eq!(expand_tilde(plain), plain.to_path_buf());
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/x.toml")), home.join("x.toml"));
        }
    }
}
