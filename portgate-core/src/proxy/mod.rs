//! Policy-gated TCP forwarding

pub mod listener;
pub mod manager;
pub mod relay;

pub use listener::{ConnectionLimits, ListenerConfig, ListenerState, ProxyListener, LOOPBACK_DESTINATION};
pub use manager::{ListenerInfo, ProxyManager};
pub use relay::{relay, Direction, RelayOutcome};
