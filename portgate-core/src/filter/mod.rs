//! Rule matching and policy evaluation

pub mod cidr;
pub mod policy;
pub mod rule;

pub use policy::{ConflictWarning, PolicyEngine};
pub use rule::{Action, ConnectionDescriptor, Protocol, Rule, RulePatch, Verdict};
