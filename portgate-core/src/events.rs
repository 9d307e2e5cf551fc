//! Block event log and system messages

use crate::error::Result;
use crate::filter::ConnectionDescriptor;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Default location of the block event log
pub const DEFAULT_EVENTS_PATH: &str = "firewall_events.jsonl";

/// One line of the event log
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct BlockEvent<'a> {
    timestamp: String,
    event: &'static str,
    source: &'a str,
    port: u16,
    protocol: String,
    reason: String,
}

/// Append-only JSON lines log of blocked connections
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a denied connection. Failures are logged, not returned.
    pub fn log_block(&self, conn: &ConnectionDescriptor, rule_id: &str) {
        let event = BlockEvent {
            timestamp: conn.timestamp.to_rfc3339(),
            event: "PacketBlocked",
            source: &conn.source_address,
            port: conn.destination_port,
            protocol: conn.protocol.to_string(),
            reason: format!("Blocked by Rule {}", rule_id),
        };

        if let Err(e) = self.append(&event) {
            warn!("Failed to write block event to {:?}: {}", self.path, e);
        }
    }

    fn append(&self, event: &BlockEvent<'_>) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Operational message for the operator
    pub fn log_system(&self, message: &str) {
        info!(target: "portgate::system", "{}", message);
    }

    /// Stored lines, optionally only those containing `filter` (case-insensitive)
    pub fn read(&self, filter: Option<&str>) -> Result<Vec<String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let needle = filter.map(str::to_lowercase);
        Ok(content
            .lines()
            .filter(|line| match &needle {
                Some(needle) => line.to_lowercase().contains(needle.as_str()),
                None => true,
            })
            .map(str::to_string)
            .collect())
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENTS_PATH)
    }
}
