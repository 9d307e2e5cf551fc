//! Configuration schema types

use crate::events::DEFAULT_EVENTS_PATH;
use crate::proxy::ConnectionLimits;
use crate::store::DEFAULT_RULES_PATH;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Complete daemon configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub common: CommonConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

/// Settings shared by every component
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommonConfig {
    #[serde(default = "default_config_version")]
    pub config_version: String,
    #[serde(default)]
    pub verbose: bool,
}

fn default_config_version() -> String {
    "1.0".to_string()
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            verbose: false,
        }
    }
}

/// Where rules and block events live on disk
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_rules_path")]
    pub rules_path: PathBuf,
    #[serde(default = "default_events_path")]
    pub events_path: PathBuf,
}

fn default_rules_path() -> PathBuf {
    PathBuf::from(DEFAULT_RULES_PATH)
}

fn default_events_path() -> PathBuf {
    PathBuf::from(DEFAULT_EVENTS_PATH)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            rules_path: default_rules_path(),
            events_path: default_events_path(),
        }
    }
}

/// HTTP management API settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

fn default_true() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000)
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_api_listen(),
        }
    }
}

/// Optional connection limits; unset means unbounded, as before limits existed
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
}

impl LimitsConfig {
    pub fn to_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_connections: self.max_connections,
            connect_timeout: self.connect_timeout_ms.map(Duration::from_millis),
            idle_timeout: self.idle_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// One forwarding listener
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProxyConfig {
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
}

pub(crate) fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl ProxyConfig {
    pub fn new(listen_port: u16, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            listen_port,
            target_host: target_host.into(),
            target_port,
            bind_address: default_bind_address(),
        }
    }

    /// Parse `LPORT:HOST:TPORT` as given on the command line
    pub fn parse_spec(spec: &str) -> Option<Self> {
        let (listen, rest) = spec.split_once(':')?;
        let (host, target) = rest.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(listen.parse().ok()?, host, target.parse().ok()?))
    }
}
