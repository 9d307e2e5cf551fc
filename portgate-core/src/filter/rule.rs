//! Rule, patch and connection descriptor types

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Enum value as stored on disk: a name, or the numeric index older rule
/// files were written with
#[derive(Deserialize)]
#[serde(untagged)]
enum EnumRepr {
    Index(u64),
    Name(String),
}

/// What happens to a connection matched by a rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum Action {
    #[default]
    Allow,
    Deny,
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match EnumRepr::deserialize(deserializer)? {
            EnumRepr::Index(0) => Ok(Action::Allow),
            EnumRepr::Index(1) => Ok(Action::Deny),
            EnumRepr::Index(n) => Err(de::Error::custom(format!("unknown action index {}", n))),
            EnumRepr::Name(name) => Action::parse(&name)
                .ok_or_else(|| de::Error::custom(format!("unknown action {:?}", name))),
        }
    }
}

impl Action {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Some(Action::Allow),
            "deny" => Some(Action::Deny),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Allow => write!(f, "Allow"),
            Action::Deny => write!(f, "Deny"),
        }
    }
}

/// Transport protocol a rule applies to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[default]
    Any,
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match EnumRepr::deserialize(deserializer)? {
            EnumRepr::Index(0) => Ok(Protocol::Tcp),
            EnumRepr::Index(1) => Ok(Protocol::Udp),
            EnumRepr::Index(2) => Ok(Protocol::Any),
            EnumRepr::Index(n) => Err(de::Error::custom(format!("unknown protocol index {}", n))),
            EnumRepr::Name(name) => Protocol::parse(&name)
                .ok_or_else(|| de::Error::custom(format!("unknown protocol {:?}", name))),
        }
    }
}

impl Protocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            "any" => Some(Protocol::Any),
            _ => None,
        }
    }

    /// `Any` on the rule side matches every concrete protocol
    pub fn admits(self, other: Protocol) -> bool {
        match self {
            Protocol::Any => true,
            concrete => concrete == other,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Any => write!(f, "Any"),
        }
    }
}

fn new_rule_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_true() -> bool {
    true
}

fn default_priority() -> i32 {
    100
}

/// Rule files written by older tooling carry `null` for unset addresses
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// A single policy statement.
///
/// The JSON keys match the rule files produced by earlier releases so that an
/// existing `rules.json` loads unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "RuleId", default = "new_rule_id")]
    pub id: String,
    #[serde(rename = "IsEnabled", default = "default_true")]
    pub enabled: bool,
    /// Lower values are evaluated first
    #[serde(rename = "Priority", default = "default_priority")]
    pub priority: i32,
    #[serde(rename = "SourceIP", default, deserialize_with = "null_as_empty")]
    pub source: String,
    #[serde(rename = "DestIP", default, deserialize_with = "null_as_empty")]
    pub destination: String,
    /// 0 matches any port
    #[serde(rename = "SourcePort", default)]
    pub source_port: u16,
    /// 0 matches any port
    #[serde(rename = "Port", default)]
    pub destination_port: u16,
    #[serde(rename = "Protocol", default)]
    pub protocol: Protocol,
    #[serde(rename = "Action", default)]
    pub action: Action,
}

impl Rule {
    /// Create an enabled rule with a fresh id, priority 100 and wildcard criteria
    pub fn new(action: Action) -> Self {
        Self {
            id: new_rule_id(),
            enabled: true,
            priority: default_priority(),
            source: String::new(),
            destination: String::new(),
            source_port: 0,
            destination_port: 0,
            protocol: Protocol::Any,
            action,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    pub fn with_source_port(mut self, port: u16) -> Self {
        self.source_port = port;
        self
    }

    pub fn with_destination_port(mut self, port: u16) -> Self {
        self.destination_port = port;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] Prio:{} {} {} Src:{}:{} -> Dst:{}:{} (Enabled: {})",
            self.id,
            self.priority,
            self.action,
            self.protocol,
            self.source,
            self.source_port,
            self.destination,
            self.destination_port,
            self.enabled
        )
    }
}

/// Partial update for an existing rule.
///
/// Ports equal to 0, empty addresses and `Protocol::Any` mean "leave as is".
/// `action`, `enabled` and `priority` are always applied, so a patch that
/// omits them resets the rule to `Allow`, enabled, priority 100. A patch
/// cannot set a port back to the wildcard or clear an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePatch {
    #[serde(rename = "IsEnabled", default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "Priority", default = "default_priority")]
    pub priority: i32,
    #[serde(rename = "SourceIP", default, deserialize_with = "null_as_empty")]
    pub source: String,
    #[serde(rename = "DestIP", default, deserialize_with = "null_as_empty")]
    pub destination: String,
    #[serde(rename = "SourcePort", default)]
    pub source_port: u16,
    #[serde(rename = "Port", default)]
    pub destination_port: u16,
    #[serde(rename = "Protocol", default)]
    pub protocol: Protocol,
    #[serde(rename = "Action", default)]
    pub action: Action,
}

impl Default for RulePatch {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: default_priority(),
            source: String::new(),
            destination: String::new(),
            source_port: 0,
            destination_port: 0,
            protocol: Protocol::Any,
            action: Action::Allow,
        }
    }
}

impl RulePatch {
    /// Merge this patch into `rule`
    pub fn apply_to(&self, rule: &mut Rule) {
        if self.destination_port != 0 {
            rule.destination_port = self.destination_port;
        }
        if self.source_port != 0 {
            rule.source_port = self.source_port;
        }
        if !self.source.is_empty() {
            rule.source = self.source.clone();
        }
        if !self.destination.is_empty() {
            rule.destination = self.destination.clone();
        }
        if self.protocol != Protocol::Any {
            rule.protocol = self.protocol;
        }

        rule.action = self.action;
        rule.enabled = self.enabled;
        rule.priority = self.priority;
    }

    /// JSON names of the fields `apply_to` will leave untouched
    pub fn ignored_fields(&self) -> Vec<&'static str> {
        let mut ignored = Vec::new();
        if self.source.is_empty() {
            ignored.push("SourceIP");
        }
        if self.destination.is_empty() {
            ignored.push("DestIP");
        }
        if self.source_port == 0 {
            ignored.push("SourcePort");
        }
        if self.destination_port == 0 {
            ignored.push("Port");
        }
        if self.protocol == Protocol::Any {
            ignored.push("Protocol");
        }
        ignored
    }
}

/// One accepted connection as seen by the policy engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub source_address: String,
    pub source_port: u16,
    pub destination_address: String,
    pub destination_port: u16,
    pub protocol: Protocol,
    pub timestamp: DateTime<Utc>,
}

impl ConnectionDescriptor {
    /// Describe a TCP connection observed now
    pub fn tcp(
        source_address: impl Into<String>,
        source_port: u16,
        destination_address: impl Into<String>,
        destination_port: u16,
    ) -> Self {
        Self {
            source_address: source_address.into(),
            source_port,
            destination_address: destination_address.into(),
            destination_port,
            protocol: Protocol::Tcp,
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of evaluating a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub action: Action,
    /// `None` when no rule matched and the default policy applied
    pub rule_id: Option<String>,
}

impl Verdict {
    pub fn is_denied(&self) -> bool {
        self.action == Action::Deny
    }
}
