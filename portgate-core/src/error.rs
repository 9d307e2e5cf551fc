//! Error types for firewall operations

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FirewallError>;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("Configuration validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Listener on port {port} is already running")]
    AlreadyListening { port: u16 },

    #[error("Failed to load config from {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to write rule store {path}: {source}")]
    Store {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Proxy on port {listen_port} has no target host")]
    EmptyTargetHost { listen_port: u16 },

    #[error("Proxy on port {listen_port} has target port 0")]
    InvalidTargetPort { listen_port: u16 },

    #[error("Listen port {port} is used by more than one proxy")]
    DuplicateListenPort { port: u16 },

    #[error("Limit {name} must be greater than zero")]
    ZeroLimit { name: &'static str },
}
