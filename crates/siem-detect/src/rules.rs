//! Detection Rule Store
//!
//! Typed rule definitions: predicate trees for simple rules, windowed
//! threshold rules, and ordered-sequence correlation rules. Rules are
//! validated when loaded; a broken rule is skipped, never fatal.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use siem_common::{NormalizedEvent, Severity, SiemError, SiemResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Comparison operator for numeric predicates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Predicate tree evaluated against normalized event fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// Field equals value (string comparison)
    Eq { field: String, value: String },
    /// Field contains substring
    Contains { field: String, value: String },
    /// Field is one of the listed values
    InSet { field: String, values: Vec<String> },
    /// Numeric comparison; non-numeric field values never match
    Cmp { field: String, cmp: CmpOp, value: f64 },
    /// All child predicates match
    All { all: Vec<Predicate> },
    /// At least one child predicate matches
    Any { any: Vec<Predicate> },
    /// Child predicate does not match
    Not { not: Box<Predicate> },
}

impl Predicate {
    /// Evaluate this predicate against an event.
    pub fn matches(&self, event: &NormalizedEvent) -> bool {
        match self {
            Predicate::Eq { field, value } => {
                event.field(field).map(|v| v == *value).unwrap_or(false)
            }
            Predicate::Contains { field, value } => event
                .field(field)
                .map(|v| v.contains(value.as_str()))
                .unwrap_or(false),
            Predicate::InSet { field, values } => event
                .field(field)
                .map(|v| values.iter().any(|c| *c == v))
                .unwrap_or(false),
            Predicate::Cmp { field, cmp, value } => event
                .field(field)
                .and_then(|v| v.parse::<f64>().ok())
                .map(|v| match cmp {
                    CmpOp::Gt => v > *value,
                    CmpOp::Gte => v >= *value,
                    CmpOp::Lt => v < *value,
                    CmpOp::Lte => v <= *value,
                })
                .unwrap_or(false),
            Predicate::All { all } => all.iter().all(|p| p.matches(event)),
            Predicate::Any { any } => any.iter().any(|p| p.matches(event)),
            Predicate::Not { not } => !not.matches(event),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Predicate::Eq { field, .. }
            | Predicate::Contains { field, .. }
            | Predicate::Cmp { field, .. } => {
                if field.is_empty() {
                    return Err("predicate field is empty".into());
                }
            }
            Predicate::InSet { field, values } => {
                if field.is_empty() {
                    return Err("predicate field is empty".into());
                }
                if values.is_empty() {
                    return Err("in_set predicate has no values".into());
                }
            }
            Predicate::All { all } => {
                if all.is_empty() {
                    return Err("all predicate has no children".into());
                }
                for p in all {
                    p.validate()?;
                }
            }
            Predicate::Any { any } => {
                if any.is_empty() {
                    return Err("any predicate has no children".into());
                }
                for p in any {
                    p.validate()?;
                }
            }
            Predicate::Not { not } => not.validate()?,
        }
        Ok(())
    }
}

/// Matching logic variant of a detection rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Direct predicate match against a single event
    Simple {
        /// Predicate tree
        predicate: Predicate,
    },
    /// Sliding-window counted match
    Threshold {
        /// Qualifying-event predicate
        predicate: Predicate,
        /// Window length in seconds
        window_secs: u64,
        /// Number of qualifying events that fires the rule
        threshold: u64,
        /// Event fields partitioning the counters
        group_by: Vec<String>,
    },
    /// Ordered multi-event sequence within a window
    Correlation {
        /// Sequence of per-step predicates, in required order
        sequence: Vec<Predicate>,
        /// Window length in seconds
        window_secs: u64,
        /// Event fields partitioning partial-match state
        group_by: Vec<String>,
    },
    /// Vendor Sigma rule text; stored but not evaluated by this engine
    Sigma {
        /// Raw rule document
        raw: String,
    },
    /// ML model reference; stored but not evaluated by this engine
    Ml {
        /// Model identifier
        model: String,
    },
}

/// Prefilters applied before the rule's matching logic. Empty lists
/// accept everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFilters {
    /// Accepted source types
    #[serde(default)]
    pub source_types: Vec<String>,
    /// Accepted event codes
    #[serde(default)]
    pub event_codes: Vec<String>,
    /// Accepted categories
    #[serde(default)]
    pub categories: Vec<String>,
}

impl RuleFilters {
    /// Whether an event passes the prefilters.
    pub fn accepts(&self, event: &NormalizedEvent) -> bool {
        let pass = |list: &[String], value: &str| list.is_empty() || list.iter().any(|v| v == value);
        pass(&self.source_types, &event.source_type)
            && pass(&self.event_codes, &event.event_code)
            && pass(&self.categories, &event.category)
    }
}

/// Auto-escalation policy: when an alert from this rule should open an
/// incident even without a matching open incident to join.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Escalate when alert severity is at or above this level
    pub min_severity: Option<Severity>,
    /// Escalate when the alert category is listed
    #[serde(default)]
    pub categories: Vec<String>,
}

impl EscalationPolicy {
    /// Whether an alert with this severity/category auto-escalates.
    pub fn should_escalate(&self, severity: Severity, category: &str) -> bool {
        if let Some(min) = self.min_severity {
            if severity >= min {
                return true;
            }
        }
        self.categories.iter().any(|c| c == category)
    }
}

/// A stored detection rule definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRule {
    /// Rule id
    pub id: String,
    /// Human-readable name; playbook triggers match on it
    pub name: String,
    /// Description
    pub description: String,
    /// Disabled rules are never evaluated
    pub enabled: bool,
    /// Severity stamped on resulting alerts
    pub severity: Severity,
    /// Evaluation order, ascending
    pub priority: u32,
    /// Category stamped on resulting alerts
    pub category: String,
    /// Matching logic
    pub kind: RuleKind,
    /// Source/code/category prefilters
    #[serde(default)]
    pub filters: RuleFilters,
    /// Whitelist predicate; a matching event suppresses the rule
    pub exception: Option<Predicate>,
    /// MITRE ATT&CK tactic stamped on resulting alerts
    pub mitre_tactic: Option<String>,
    /// MITRE ATT&CK technique stamped on resulting alerts
    pub mitre_technique: Option<String>,
    /// Auto-escalation policy for resulting alerts
    #[serde(default)]
    pub escalation: EscalationPolicy,
}

impl DetectionRule {
    fn validate(&self) -> SiemResult<()> {
        let fail = |reason: String| {
            Err(SiemError::InvalidRule {
                rule_id: self.id.clone(),
                reason,
            })
        };
        if self.id.is_empty() {
            return fail("rule id is empty".into());
        }
        match &self.kind {
            RuleKind::Simple { predicate } => {
                if let Err(e) = predicate.validate() {
                    return fail(e);
                }
            }
            RuleKind::Threshold {
                predicate,
                window_secs,
                threshold,
                ..
            } => {
                if let Err(e) = predicate.validate() {
                    return fail(e);
                }
                if *window_secs == 0 {
                    return fail("threshold window_secs must be positive".into());
                }
                if *threshold == 0 {
                    return fail("threshold count must be positive".into());
                }
            }
            RuleKind::Correlation {
                sequence,
                window_secs,
                ..
            } => {
                if sequence.len() < 2 {
                    return fail("correlation sequence needs at least two steps".into());
                }
                if *window_secs == 0 {
                    return fail("correlation window_secs must be positive".into());
                }
                for p in sequence {
                    if let Err(e) = p.validate() {
                        return fail(e);
                    }
                }
            }
            RuleKind::Sigma { raw } => {
                if raw.trim().is_empty() {
                    return fail("sigma rule text is empty".into());
                }
            }
            RuleKind::Ml { model } => {
                if model.is_empty() {
                    return fail("ml model reference is empty".into());
                }
            }
        }
        Ok(())
    }
}

/// Mutable per-rule counters, updated by the alert generator.
#[derive(Default)]
pub struct RuleStats {
    total_matches: AtomicU64,
    false_positives: AtomicU64,
    last_match: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of [`RuleStats`].
#[derive(Debug, Clone, Serialize)]
pub struct RuleStatsSnapshot {
    /// Total alerts produced by the rule
    pub total_matches: u64,
    /// Alerts later marked false positive
    pub false_positives: u64,
    /// Most recent match time
    pub last_match: Option<DateTime<Utc>>,
}

impl RuleStats {
    /// Record one match at the given time. Last-match time is monotonic.
    pub fn record_match(&self, at: DateTime<Utc>) {
        self.total_matches.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last_match.lock();
        if last.map(|prev| at > prev).unwrap_or(true) {
            *last = Some(at);
        }
    }

    /// Record a false-positive verdict.
    pub fn record_false_positive(&self) {
        self.false_positives.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters.
    pub fn snapshot(&self) -> RuleStatsSnapshot {
        RuleStatsSnapshot {
            total_matches: self.total_matches.load(Ordering::Relaxed),
            false_positives: self.false_positives.load(Ordering::Relaxed),
            last_match: *self.last_match.lock(),
        }
    }
}

/// Shared store of detection rules, read by evaluators and written by the
/// administration layer.
pub struct RuleStore {
    rules: DashMap<String, DetectionRule>,
    stats: DashMap<String, Arc<RuleStats>>,
}

impl RuleStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
            stats: DashMap::new(),
        }
    }

    /// Load a batch of rules. Invalid rules are skipped and their errors
    /// returned; valid rules are inserted regardless.
    pub fn load(&self, rules: Vec<DetectionRule>) -> Vec<SiemError> {
        let mut errors = Vec::new();
        for rule in rules {
            match self.upsert(rule) {
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "skipping invalid rule");
                    errors.push(e);
                }
            }
        }
        errors
    }

    /// Insert or replace one rule after validation.
    pub fn upsert(&self, rule: DetectionRule) -> SiemResult<()> {
        rule.validate()?;
        self.stats
            .entry(rule.id.clone())
            .or_insert_with(|| Arc::new(RuleStats::default()));
        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    /// Fetch one rule.
    pub fn get(&self, rule_id: &str) -> Option<DetectionRule> {
        self.rules.get(rule_id).map(|r| r.clone())
    }

    /// Enabled rules in ascending priority order.
    pub fn enabled_ordered(&self) -> Vec<DetectionRule> {
        let mut rules: Vec<DetectionRule> = self
            .rules
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.clone())
            .collect();
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        rules
    }

    /// Per-rule counters handle.
    pub fn stats(&self, rule_id: &str) -> Option<Arc<RuleStats>> {
        self.stats.get(rule_id).map(|s| s.clone())
    }

    /// Number of stored rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn event(user: &str, code: &str) -> NormalizedEvent {
        NormalizedEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_time: Utc::now(),
            source_type: "windows_security".into(),
            event_code: code.into(),
            severity: Severity::Medium,
            category: "authentication".into(),
            host: Some("ws-042".into()),
            subject_user: Some(user.into()),
            source_ip: Some("10.0.0.7".into()),
            target_ip: None,
            process_name: None,
            mitre_tactic: None,
            mitre_technique: None,
            extra: HashMap::new(),
        }
    }

    fn simple_rule(id: &str, predicate: Predicate) -> DetectionRule {
        DetectionRule {
            id: id.into(),
            name: format!("rule {}", id),
            description: String::new(),
            enabled: true,
            severity: Severity::High,
            priority: 10,
            category: "authentication".into(),
            kind: RuleKind::Simple { predicate },
            filters: RuleFilters::default(),
            exception: None,
            mitre_tactic: None,
            mitre_technique: None,
            escalation: EscalationPolicy::default(),
        }
    }

    #[test]
    fn predicate_tree_evaluation() {
        let e = event("jdoe", "4625");
        let p = Predicate::All {
            all: vec![
                Predicate::Eq {
                    field: "event_code".into(),
                    value: "4625".into(),
                },
                Predicate::Not {
                    not: Box::new(Predicate::Eq {
                        field: "subject_user".into(),
                        value: "svc_backup".into(),
                    }),
                },
                Predicate::Any {
                    any: vec![
                        Predicate::Contains {
                            field: "source_ip".into(),
                            value: "10.0.".into(),
                        },
                        Predicate::InSet {
                            field: "host".into(),
                            values: vec!["dc-01".into()],
                        },
                    ],
                },
            ],
        };
        assert!(p.matches(&e));
    }

    #[test]
    fn numeric_predicate_ignores_non_numeric() {
        let e = event("jdoe", "4625");
        let numeric = Predicate::Cmp {
            field: "severity".into(),
            cmp: CmpOp::Gte,
            value: 2.0,
        };
        assert!(numeric.matches(&e));
        let non_numeric = Predicate::Cmp {
            field: "subject_user".into(),
            cmp: CmpOp::Gt,
            value: 0.0,
        };
        assert!(!non_numeric.matches(&e));
    }

    #[test]
    fn load_isolates_invalid_rules() {
        let store = RuleStore::new();
        let bad = DetectionRule {
            kind: RuleKind::Threshold {
                predicate: Predicate::Eq {
                    field: "event_code".into(),
                    value: "4625".into(),
                },
                window_secs: 0,
                threshold: 5,
                group_by: vec![],
            },
            ..simple_rule(
                "bad",
                Predicate::Eq {
                    field: "x".into(),
                    value: "y".into(),
                },
            )
        };
        let good = simple_rule(
            "good",
            Predicate::Eq {
                field: "event_code".into(),
                value: "4625".into(),
            },
        );
        let errors = store.load(vec![bad, good]);
        assert_eq!(errors.len(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("good").is_some());
    }

    #[test]
    fn enabled_ordered_sorts_by_priority() {
        let store = RuleStore::new();
        let mut a = simple_rule(
            "a",
            Predicate::Eq {
                field: "x".into(),
                value: "y".into(),
            },
        );
        a.priority = 50;
        let mut b = simple_rule(
            "b",
            Predicate::Eq {
                field: "x".into(),
                value: "y".into(),
            },
        );
        b.priority = 5;
        let mut c = simple_rule(
            "c",
            Predicate::Eq {
                field: "x".into(),
                value: "y".into(),
            },
        );
        c.enabled = false;
        assert!(store.load(vec![a, b, c]).is_empty());
        let ordered = store.enabled_ordered();
        assert_eq!(
            ordered.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
    }

    #[test]
    fn rule_stats_last_match_is_monotonic() {
        let stats = RuleStats::default();
        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(60);
        stats.record_match(later);
        stats.record_match(earlier);
        let snap = stats.snapshot();
        assert_eq!(snap.total_matches, 2);
        assert_eq!(snap.last_match, Some(later));
    }

    #[test]
    fn filters_accept_on_empty_lists() {
        let e = event("jdoe", "4625");
        assert!(RuleFilters::default().accepts(&e));
        let filters = RuleFilters {
            source_types: vec!["syslog".into()],
            ..Default::default()
        };
        assert!(!filters.accepts(&e));
    }
}
