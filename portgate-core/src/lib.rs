//! Priority-ordered TCP access control with a forwarding proxy

pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod proxy;
pub mod store;

// Re-export commonly used types
pub use config::{Config, ConfigLoader, ConfigValidator, ProxyConfig};
pub use error::{FirewallError, Result, ValidationError};
pub use events::EventLog;
pub use filter::{
    Action, ConflictWarning, ConnectionDescriptor, PolicyEngine, Protocol, Rule, RulePatch, Verdict,
};
pub use proxy::{ConnectionLimits, ListenerConfig, ProxyListener, ProxyManager};
pub use store::RuleStore;
