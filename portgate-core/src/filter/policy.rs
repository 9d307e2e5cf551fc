//! Policy engine owning the rule table

use super::cidr;
use super::rule::{Action, ConnectionDescriptor, Rule, RulePatch, Verdict};
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Informational finding produced when a rule is added
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictWarning {
    /// An existing rule has the same criteria, action and priority
    Duplicate { existing: String },
    /// An existing rule at the same priority matches the same traffic with the opposite action
    Contradiction {
        existing: String,
        existing_action: Action,
    },
}

impl fmt::Display for ConflictWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictWarning::Duplicate { existing } => {
                write!(f, "DUPLICATE: Rule {} is identical.", existing)
            }
            ConflictWarning::Contradiction {
                existing,
                existing_action,
            } => write!(
                f,
                "CONFLICT: Rule {} has same criteria/priority but different Action ({}).",
                existing, existing_action
            ),
        }
    }
}

/// Ordered rule table with first-match-wins evaluation.
///
/// Every operation holds the table lock for its full duration. `evaluate`
/// sorts and scans under one read guard, so it never observes a half-applied
/// mutation.
#[derive(Debug, Default)]
pub struct PolicyEngine {
    rules: RwLock<Vec<Rule>>,
}

impl PolicyEngine {
    /// Create an engine with an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine pre-populated with `rules`, in order
    pub fn with_rules(rules: Vec<Rule>) -> Self {
        let engine = Self::new();
        engine.reload(rules);
        engine
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Rule>> {
        self.rules.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Rule>> {
        self.rules.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a rule. Conflicts with the existing table are reported, never enforced.
    pub fn add(&self, rule: Rule) -> Vec<ConflictWarning> {
        let mut rules = self.write();
        Self::insert(&mut rules, rule)
    }

    fn insert(rules: &mut Vec<Rule>, rule: Rule) -> Vec<ConflictWarning> {
        let warnings = conflicts_in(rules, &rule);
        info!("Rule added: {}", rule);
        for warning in &warnings {
            warn!("{}", warning);
        }
        rules.push(rule);
        warnings
    }

    /// Remove a rule by id. Returns false if no such rule exists.
    pub fn remove(&self, id: &str) -> bool {
        let mut rules = self.write();
        match rules.iter().position(|r| r.id == id) {
            Some(index) => {
                rules.remove(index);
                info!("Rule {} removed", id);
                true
            }
            None => false,
        }
    }

    /// Enable or disable a rule. Returns false if no such rule exists.
    pub fn toggle(&self, id: &str, enabled: bool) -> bool {
        let mut rules = self.write();
        match rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                debug!("Rule {} enabled={}", id, enabled);
                true
            }
            None => false,
        }
    }

    /// Flip a rule's enabled flag, returning the new state
    pub fn invert(&self, id: &str) -> Option<bool> {
        let mut rules = self.write();
        let rule = rules.iter_mut().find(|r| r.id == id)?;
        rule.enabled = !rule.enabled;
        debug!("Rule {} enabled={}", id, rule.enabled);
        Some(rule.enabled)
    }

    /// Merge `patch` into the rule with `id`. See [`RulePatch`] for the merge rules.
    pub fn update(&self, id: &str, patch: &RulePatch) -> bool {
        let mut rules = self.write();
        match rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                patch.apply_to(rule);
                info!("Rule {} updated", id);
                true
            }
            None => false,
        }
    }

    /// Drop every rule
    pub fn clear(&self) {
        self.write().clear();
        info!("All rules cleared");
    }

    /// Replace the whole table, adding `rules` one by one as `add` would
    pub fn reload(&self, rules: Vec<Rule>) -> Vec<ConflictWarning> {
        let mut table = self.write();
        table.clear();
        rules
            .into_iter()
            .flat_map(|rule| Self::insert(&mut table, rule))
            .collect()
    }

    /// Copy of the table in insertion order
    pub fn snapshot(&self) -> Vec<Rule> {
        self.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<Rule> {
        self.read().iter().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Resolve a connection to a verdict.
    ///
    /// Enabled rules are tried in ascending priority, ties in table order.
    /// The first rule whose criteria all match decides; with no match the
    /// connection is allowed.
    pub fn evaluate(&self, conn: &ConnectionDescriptor) -> Verdict {
        let rules = self.read();

        let mut candidates: Vec<&Rule> = rules.iter().filter(|r| r.enabled).collect();
        // stable sort keeps table order among equal priorities
        candidates.sort_by_key(|r| r.priority);

        candidates
            .into_iter()
            .find(|rule| rule_matches(rule, conn))
            .map(|rule| Verdict {
                action: rule.action,
                rule_id: Some(rule.id.clone()),
            })
            .unwrap_or(Verdict {
                action: Action::Allow,
                rule_id: None,
            })
    }

    /// Report duplicates and same-priority contradictions of `candidate`
    pub fn detect_conflicts(&self, candidate: &Rule) -> Vec<ConflictWarning> {
        conflicts_in(&self.read(), candidate)
    }
}

fn rule_matches(rule: &Rule, conn: &ConnectionDescriptor) -> bool {
    rule.protocol.admits(conn.protocol)
        && (rule.destination_port == 0 || rule.destination_port == conn.destination_port)
        && (rule.source_port == 0 || rule.source_port == conn.source_port)
        && cidr::matches(&conn.source_address, &rule.source)
        && cidr::matches(&conn.destination_address, &rule.destination)
}

fn conflicts_in(rules: &[Rule], candidate: &Rule) -> Vec<ConflictWarning> {
    let mut warnings = Vec::new();

    for existing in rules.iter().filter(|r| r.id != candidate.id) {
        let same_traffic = existing.source == candidate.source
            && existing.destination_port == candidate.destination_port
            && existing.protocol == candidate.protocol;

        if same_traffic
            && existing.destination == candidate.destination
            && existing.source_port == candidate.source_port
            && existing.action == candidate.action
            && existing.priority == candidate.priority
        {
            warnings.push(ConflictWarning::Duplicate {
                existing: existing.id.clone(),
            });
        }

        if same_traffic
            && existing.action != candidate.action
            && existing.priority == candidate.priority
        {
            warnings.push(ConflictWarning::Contradiction {
                existing: existing.id.clone(),
                existing_action: existing.action,
            });
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::rule::Protocol;
    use std::sync::Arc;
    use std::thread;

    fn conn(source: &str, source_port: u16, destination_port: u16) -> ConnectionDescriptor {
        ConnectionDescriptor::tcp(source, source_port, "127.0.0.1", destination_port)
    }

    #[test]
    fn test_empty_table_allows() {
        let engine = PolicyEngine::new();
        let verdict = engine.evaluate(&conn("1.2.3.4", 5000, 8080));
        assert_eq!(verdict.action, Action::Allow);
        assert_eq!(verdict.rule_id, None);
    }

    #[test]
    fn test_priority_beats_table_order() {
        let engine = PolicyEngine::new();
        engine.add(Rule::new(Action::Allow).with_id("late").with_priority(50));
        engine.add(Rule::new(Action::Deny).with_id("early").with_priority(10));

        let verdict = engine.evaluate(&conn("1.2.3.4", 5000, 8080));
        assert_eq!(verdict.action, Action::Deny);
        assert_eq!(verdict.rule_id.as_deref(), Some("early"));
    }

    #[test]
    fn test_equal_priority_uses_table_order() {
        let engine = PolicyEngine::new();
        engine.add(Rule::new(Action::Allow).with_id("first").with_priority(10));
        engine.add(Rule::new(Action::Deny).with_id("second").with_priority(10));

        let verdict = engine.evaluate(&conn("1.2.3.4", 5000, 8080));
        assert_eq!(verdict.rule_id.as_deref(), Some("first"));
    }

    #[test]
    fn test_disabled_rule_never_matches() {
        let engine = PolicyEngine::new();
        engine.add(Rule::new(Action::Deny).with_id("off").disabled());

        let verdict = engine.evaluate(&conn("1.2.3.4", 5000, 8080));
        assert_eq!(verdict.action, Action::Allow);
        assert_eq!(verdict.rule_id, None);

        assert!(engine.toggle("off", true));
        assert!(engine.evaluate(&conn("1.2.3.4", 5000, 8080)).is_denied());
    }

    #[test]
    fn test_all_criteria_must_match() {
        let engine = PolicyEngine::new();
        engine.add(
            Rule::new(Action::Deny)
                .with_id("narrow")
                .with_source("10.0.0.0/8")
                .with_destination("127.0.0.1")
                .with_source_port(4000)
                .with_destination_port(22)
                .with_protocol(Protocol::Tcp),
        );

        assert!(engine.evaluate(&conn("10.1.2.3", 4000, 22)).is_denied());
        assert!(!engine.evaluate(&conn("11.1.2.3", 4000, 22)).is_denied());
        assert!(!engine.evaluate(&conn("10.1.2.3", 4001, 22)).is_denied());
        assert!(!engine.evaluate(&conn("10.1.2.3", 4000, 23)).is_denied());

        let mut udp = conn("10.1.2.3", 4000, 22);
        udp.protocol = Protocol::Udp;
        assert!(!engine.evaluate(&udp).is_denied());

        let mut elsewhere = conn("10.1.2.3", 4000, 22);
        elsewhere.destination_address = "192.168.0.1".to_string();
        assert!(!engine.evaluate(&elsewhere).is_denied());
    }

    #[test]
    fn test_malformed_deny_rule_falls_through() {
        let engine = PolicyEngine::new();
        engine.add(Rule::new(Action::Deny).with_source("abc/99"));
        assert_eq!(engine.evaluate(&conn("1.2.3.4", 1, 2)).action, Action::Allow);
    }

    #[test]
    fn test_scenario_port_22_denied() {
        let engine = PolicyEngine::new();
        engine.add(
            Rule::new(Action::Deny)
                .with_id("ssh")
                .with_priority(5)
                .with_protocol(Protocol::Tcp)
                .with_destination_port(22),
        );
        engine.add(Rule::new(Action::Allow).with_id("rest").with_priority(100));

        let ssh = engine.evaluate(&conn("1.2.3.4", 5000, 22));
        assert_eq!(ssh.action, Action::Deny);
        assert_eq!(ssh.rule_id.as_deref(), Some("ssh"));

        let web = engine.evaluate(&conn("1.2.3.4", 5000, 80));
        assert_eq!(web.action, Action::Allow);
        assert_eq!(web.rule_id.as_deref(), Some("rest"));
    }

    #[test]
    fn test_remove_unknown_id_leaves_table() {
        let engine = PolicyEngine::new();
        engine.add(Rule::new(Action::Deny).with_id("a"));
        let before = engine.snapshot();

        assert!(!engine.remove("missing"));
        assert_eq!(engine.snapshot(), before);

        assert!(engine.remove("a"));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_toggle_and_update_unknown_id() {
        let engine = PolicyEngine::new();
        assert!(!engine.toggle("missing", false));
        assert!(!engine.update("missing", &RulePatch::default()));
        assert_eq!(engine.invert("missing"), None);
    }

    #[test]
    fn test_invert() {
        let engine = PolicyEngine::new();
        engine.add(Rule::new(Action::Deny).with_id("a"));
        assert_eq!(engine.invert("a"), Some(false));
        assert_eq!(engine.invert("a"), Some(true));
    }

    #[test]
    fn test_update_keeps_id() {
        let engine = PolicyEngine::new();
        engine.add(Rule::new(Action::Deny).with_id("a").with_destination_port(22));

        let patch = RulePatch {
            action: Action::Deny,
            priority: 1,
            source: "10.0.0.0/8".to_string(),
            ..RulePatch::default()
        };
        assert!(engine.update("a", &patch));

        let rule = engine.get("a").unwrap();
        assert_eq!(rule.id, "a");
        assert_eq!(rule.priority, 1);
        assert_eq!(rule.source, "10.0.0.0/8");
        assert_eq!(rule.destination_port, 22);
    }

    #[test]
    fn test_duplicate_detection() {
        let engine = PolicyEngine::new();
        let base = Rule::new(Action::Deny)
            .with_id("a")
            .with_source("10.0.0.0/8")
            .with_destination_port(22)
            .with_protocol(Protocol::Tcp)
            .with_priority(10);
        engine.add(base.clone());

        let twin = base.clone().with_id("b");
        assert_eq!(
            engine.add(twin),
            vec![ConflictWarning::Duplicate {
                existing: "a".to_string()
            }]
        );

        let shifted = base.clone().with_id("c").with_priority(11);
        assert!(engine.detect_conflicts(&shifted).is_empty());

        // a rule is never compared with itself
        assert_eq!(
            engine.detect_conflicts(&base),
            vec![ConflictWarning::Duplicate {
                existing: "b".to_string()
            }]
        );
    }

    #[test]
    fn test_contradiction_detection() {
        let engine = PolicyEngine::new();
        engine.add(
            Rule::new(Action::Deny)
                .with_id("a")
                .with_destination_port(22)
                .with_priority(10),
        );

        let opposite = Rule::new(Action::Allow)
            .with_id("b")
            .with_destination_port(22)
            .with_destination("10.0.0.1")
            .with_priority(10);
        assert_eq!(
            engine.detect_conflicts(&opposite),
            vec![ConflictWarning::Contradiction {
                existing: "a".to_string(),
                existing_action: Action::Deny,
            }]
        );

        let lower = opposite.clone().with_priority(20);
        assert!(engine.detect_conflicts(&lower).is_empty());
    }

    #[test]
    fn test_add_checks_table_before_append() {
        let engine = PolicyEngine::new();
        assert!(engine.add(Rule::new(Action::Deny).with_id("a")).is_empty());
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_reload_replaces_table() {
        let engine = PolicyEngine::with_rules(vec![Rule::new(Action::Deny).with_id("old")]);
        let warnings = engine.reload(vec![
            Rule::new(Action::Allow).with_id("x"),
            Rule::new(Action::Allow).with_id("y"),
        ]);

        assert_eq!(warnings.len(), 1);
        let ids: Vec<_> = engine.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["x", "y"]);

        engine.clear();
        assert!(engine.is_empty());
    }

    #[test]
    fn test_concurrent_evaluate_and_mutate() {
        let engine = Arc::new(PolicyEngine::new());
        let mut handles = vec![];

        for i in 0..8 {
            let engine = engine.clone();
            handles.push(thread::spawn(move || {
                for j in 0..50 {
                    let id = format!("r{}-{}", i, j);
                    engine.add(Rule::new(Action::Deny).with_id(id.clone()).with_priority(j));
                    let verdict = engine.evaluate(&conn("1.2.3.4", 1, 2));
                    assert!(verdict.is_denied());
                    assert!(engine.remove(&id));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(engine.is_empty());
    }
}
