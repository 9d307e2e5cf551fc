//! JSON file persistence for the rule table

use crate::error::{FirewallError, Result};
use crate::filter::Rule;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Default location of the rule file
pub const DEFAULT_RULES_PATH: &str = "rules.json";

/// Loads and saves the rule table as a JSON array
#[derive(Debug, Clone)]
pub struct RuleStore {
    path: PathBuf,
}

impl RuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored rules in file order.
    ///
    /// A missing or unreadable file yields an empty table.
    pub fn load(&self) -> Vec<Rule> {
        if !self.path.exists() {
            debug!("Rule file {:?} not found, starting with an empty table", self.path);
            return Vec::new();
        }

        match self.try_load() {
            Ok(rules) => {
                info!("Loaded {} rules from {:?}", rules.len(), self.path);
                rules
            }
            Err(e) => {
                warn!("Error loading rules from {:?}: {}", self.path, e);
                Vec::new()
            }
        }
    }

    fn try_load(&self) -> Result<Vec<Rule>> {
        let contents = fs::read_to_string(&self.path)?;
        let rules: Option<Vec<Rule>> = serde_json::from_str(&contents)?;
        Ok(rules.unwrap_or_default())
    }

    /// Write `rules` as pretty-printed JSON, replacing the file atomically
    pub fn save(&self, rules: &[Rule]) -> Result<()> {
        let json = serde_json::to_string_pretty(rules)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let store_err = |source| FirewallError::Store {
            path: self.path.clone(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(dir).map_err(store_err)?;
        tmp.write_all(json.as_bytes()).map_err(store_err)?;
        tmp.persist(&self.path).map_err(|e| store_err(e.error))?;

        info!("Saved {} rules to {:?}", rules.len(), self.path);
        Ok(())
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new(DEFAULT_RULES_PATH)
    }
}
