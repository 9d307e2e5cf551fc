//! Configuration management for the firewall daemon

pub mod loader;
pub mod schema;
pub mod validator;

pub use loader::ConfigLoader;
pub use schema::{ApiConfig, CommonConfig, Config, LimitsConfig, ProxyConfig, StoreConfig};
pub use validator::ConfigValidator;
