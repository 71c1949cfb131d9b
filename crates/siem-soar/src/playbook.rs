//! Playbook Definitions
//!
//! Automated response workflows: a trigger predicate over alert and
//! incident attributes, an ordered action list with per-action retry and
//! timeout budgets, an optional approval gate, and run statistics.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use siem_common::{Severity, SiemError, SiemResult};
use siem_detect::{Alert, Incident};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Response action kinds. Every kind maps to a registered handler; an
/// unregistered kind fails playbook validation, not execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    BlockIp,
    IsolateHost,
    KillProcess,
    SendEmail,
    CreateTicket,
    SlackNotification,
    QuarantineFile,
    DisableUserAccount,
    CheckThreatIntelligence,
}

impl ActionKind {
    /// Stable snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::BlockIp => "block_ip",
            ActionKind::IsolateHost => "isolate_host",
            ActionKind::KillProcess => "kill_process",
            ActionKind::SendEmail => "send_email",
            ActionKind::CreateTicket => "create_ticket",
            ActionKind::SlackNotification => "slack_notification",
            ActionKind::QuarantineFile => "quarantine_file",
            ActionKind::DisableUserAccount => "disable_user_account",
            ActionKind::CheckThreatIntelligence => "check_threat_intelligence",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured step of a playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookAction {
    pub id: String,
    pub name: String,
    pub kind: ActionKind,
    /// Handler-specific configuration
    #[serde(default)]
    pub config: HashMap<String, String>,
    /// Hard deadline per attempt; a timed-out attempt counts as a failure
    pub timeout_seconds: u64,
    /// Retries after the initial attempt
    pub retry_count: u32,
    /// Delay between attempts
    pub retry_delay_seconds: u64,
    /// Record the failure and move on instead of failing the execution
    pub continue_on_failure: bool,
    /// Compensating action invoked if a later step fails
    pub rollback: Option<Box<PlaybookAction>>,
}

impl PlaybookAction {
    fn validate(&self, playbook_id: &str) -> SiemResult<()> {
        let fail = |reason: String| {
            Err(SiemError::InvalidPlaybook {
                playbook_id: playbook_id.to_string(),
                reason,
            })
        };
        if self.id.is_empty() {
            return fail("action id is empty".into());
        }
        if self.timeout_seconds == 0 {
            return fail(format!("action {} has zero timeout", self.id));
        }
        if let Some(rollback) = &self.rollback {
            if rollback.rollback.is_some() {
                return fail(format!("action {} nests a rollback inside a rollback", self.id));
            }
            rollback.validate(playbook_id)?;
        }
        Ok(())
    }
}

/// Operator for free-form trigger conditions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    Regex,
}

/// Free-form condition over alert/incident context fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: String,
}

impl TriggerCondition {
    /// Evaluate against a flattened context map.
    pub fn matches(&self, context: &HashMap<String, String>) -> bool {
        let value = context.get(&self.field);
        match self.operator {
            ConditionOperator::Equals => value.map(|v| *v == self.value).unwrap_or(false),
            ConditionOperator::NotEquals => value.map(|v| *v != self.value).unwrap_or(true),
            ConditionOperator::Contains => {
                value.map(|v| v.contains(&self.value)).unwrap_or(false)
            }
            ConditionOperator::Regex => match regex::Regex::new(&self.value) {
                Ok(re) => value.map(|v| re.is_match(v)).unwrap_or(false),
                Err(_) => false,
            },
        }
    }

    fn validate(&self, playbook_id: &str) -> SiemResult<()> {
        if self.field.is_empty() {
            return Err(SiemError::InvalidPlaybook {
                playbook_id: playbook_id.to_string(),
                reason: "trigger condition field is empty".into(),
            });
        }
        if self.operator == ConditionOperator::Regex {
            if let Err(e) = regex::Regex::new(&self.value) {
                return Err(SiemError::InvalidPlaybook {
                    playbook_id: playbook_id.to_string(),
                    reason: format!("trigger condition regex invalid: {}", e),
                });
            }
        }
        Ok(())
    }
}

/// Trigger predicate: the union of its non-empty clauses. A playbook
/// with no clauses never auto-triggers (manual runs only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaybookTrigger {
    /// Severity set
    #[serde(default)]
    pub severities: Vec<Severity>,
    /// MITRE tactic set
    #[serde(default)]
    pub mitre_tactics: Vec<String>,
    /// Originating-rule name set
    #[serde(default)]
    pub rule_names: Vec<String>,
    /// Free-form condition over the alert/incident context
    pub condition: Option<TriggerCondition>,
}

impl PlaybookTrigger {
    /// Whether the trigger fires for an alert.
    pub fn matches_alert(&self, alert: &Alert) -> bool {
        if self.severities.contains(&alert.severity) {
            return true;
        }
        if let Some(tactic) = &alert.mitre_tactic {
            if self.mitre_tactics.iter().any(|t| t == tactic) {
                return true;
            }
        }
        if self.rule_names.iter().any(|n| n == &alert.rule_name) {
            return true;
        }
        if let Some(condition) = &self.condition {
            return condition.matches(&alert_context(alert));
        }
        false
    }

    /// Whether the trigger fires for an incident.
    pub fn matches_incident(&self, incident: &Incident) -> bool {
        if self.severities.contains(&incident.severity) {
            return true;
        }
        if incident
            .mitre_tactics
            .iter()
            .any(|t| self.mitre_tactics.iter().any(|mt| mt == t))
        {
            return true;
        }
        if let Some(condition) = &self.condition {
            return condition.matches(&incident_context(incident));
        }
        false
    }
}

/// Flatten an alert into the string map seen by trigger conditions and
/// action handlers.
pub fn alert_context(alert: &Alert) -> HashMap<String, String> {
    let mut ctx = HashMap::new();
    ctx.insert("alert_id".into(), alert.id.clone());
    ctx.insert("external_ref".into(), alert.external_ref.clone());
    ctx.insert("rule_id".into(), alert.rule_id.clone());
    ctx.insert("rule_name".into(), alert.rule_name.clone());
    ctx.insert("severity".into(), alert.severity.level().to_string());
    ctx.insert("title".into(), alert.title.clone());
    ctx.insert("category".into(), alert.category.clone());
    ctx.insert("status".into(), alert.status.as_str().into());
    ctx.insert("event_count".into(), alert.event_count.to_string());
    if let Some(v) = &alert.host {
        ctx.insert("host".into(), v.clone());
    }
    if let Some(v) = &alert.subject_user {
        ctx.insert("subject_user".into(), v.clone());
    }
    if let Some(v) = &alert.source_ip {
        ctx.insert("source_ip".into(), v.clone());
    }
    if let Some(v) = &alert.process_name {
        ctx.insert("process_name".into(), v.clone());
    }
    if let Some(v) = &alert.mitre_tactic {
        ctx.insert("mitre_tactic".into(), v.clone());
    }
    if let Some(v) = &alert.mitre_technique {
        ctx.insert("mitre_technique".into(), v.clone());
    }
    if let Some(v) = &alert.incident_id {
        ctx.insert("incident_id".into(), v.clone());
    }
    ctx
}

fn incident_context(incident: &Incident) -> HashMap<String, String> {
    let mut ctx = HashMap::new();
    ctx.insert("incident_id".into(), incident.id.clone());
    ctx.insert("external_ref".into(), incident.external_ref.clone());
    ctx.insert("title".into(), incident.title.clone());
    ctx.insert("severity".into(), incident.severity.level().to_string());
    ctx.insert("status".into(), incident.status.as_str().into());
    ctx.insert("alert_count".into(), incident.alert_count.to_string());
    ctx
}

/// An automated response workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub trigger: PlaybookTrigger,
    /// Steps, executed strictly in order
    pub actions: Vec<PlaybookAction>,
    /// Gate execution behind an operator decision
    pub requires_approval: bool,
    /// Severities that skip the approval gate
    #[serde(default)]
    pub auto_approve_severities: Vec<Severity>,
    pub created_at: DateTime<Utc>,
}

impl Playbook {
    fn validate(&self) -> SiemResult<()> {
        if self.id.is_empty() {
            return Err(SiemError::InvalidPlaybook {
                playbook_id: "<unset>".into(),
                reason: "playbook id is empty".into(),
            });
        }
        if self.actions.is_empty() {
            return Err(SiemError::InvalidPlaybook {
                playbook_id: self.id.clone(),
                reason: "playbook has no actions".into(),
            });
        }
        for action in &self.actions {
            action.validate(&self.id)?;
        }
        if let Some(condition) = &self.trigger.condition {
            condition.validate(&self.id)?;
        }
        Ok(())
    }
}

/// Run statistics, updated by the execution engine.
#[derive(Default)]
pub struct PlaybookStats {
    executions: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    last_executed: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of [`PlaybookStats`].
#[derive(Debug, Clone, Serialize)]
pub struct PlaybookStatsSnapshot {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_executed: Option<DateTime<Utc>>,
}

impl PlaybookStats {
    /// An execution started.
    pub fn record_execution(&self, at: DateTime<Utc>) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        *self.last_executed.lock() = Some(at);
    }

    /// An execution reached success/failure.
    pub fn record_outcome(&self, success: bool) {
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot the counters.
    pub fn snapshot(&self) -> PlaybookStatsSnapshot {
        PlaybookStatsSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_executed: *self.last_executed.lock(),
        }
    }
}

/// Shared playbook store, read by the matcher and execution engine.
pub struct PlaybookStore {
    playbooks: DashMap<String, Playbook>,
    stats: DashMap<String, Arc<PlaybookStats>>,
}

impl PlaybookStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            playbooks: DashMap::new(),
            stats: DashMap::new(),
        }
    }

    /// Load a batch; invalid playbooks are skipped and their errors
    /// returned.
    pub fn load(&self, playbooks: Vec<Playbook>) -> Vec<SiemError> {
        let mut errors = Vec::new();
        for playbook in playbooks {
            if let Err(e) = self.upsert(playbook) {
                tracing::warn!(error = %e, "skipping invalid playbook");
                errors.push(e);
            }
        }
        errors
    }

    /// Insert or replace one playbook after validation.
    pub fn upsert(&self, playbook: Playbook) -> SiemResult<()> {
        playbook.validate()?;
        self.stats
            .entry(playbook.id.clone())
            .or_insert_with(|| Arc::new(PlaybookStats::default()));
        tracing::info!(playbook_id = %playbook.id, name = %playbook.name, "playbook registered");
        self.playbooks.insert(playbook.id.clone(), playbook);
        Ok(())
    }

    /// Fetch one playbook.
    pub fn get(&self, playbook_id: &str) -> Option<Playbook> {
        self.playbooks.get(playbook_id).map(|p| p.clone())
    }

    /// Enabled playbooks.
    pub fn enabled(&self) -> Vec<Playbook> {
        self.playbooks
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.clone())
            .collect()
    }

    /// Per-playbook counters handle.
    pub fn stats(&self, playbook_id: &str) -> Option<Arc<PlaybookStats>> {
        self.stats.get(playbook_id).map(|s| s.clone())
    }

    /// Number of stored playbooks.
    pub fn len(&self) -> usize {
        self.playbooks.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.playbooks.is_empty()
    }

    /// Register the stock containment playbooks shipped with the
    /// platform.
    pub fn seed_defaults(&self) {
        let _ = self.upsert(Playbook {
            id: "brute-force-containment".into(),
            name: "Brute Force Containment".into(),
            description: "Block the attacking source and notify the SOC".into(),
            enabled: true,
            trigger: PlaybookTrigger {
                severities: vec![],
                mitre_tactics: vec![],
                rule_names: vec!["Brute Force Logon".into()],
                condition: None,
            },
            actions: vec![
                PlaybookAction {
                    id: "block".into(),
                    name: "Block source IP".into(),
                    kind: ActionKind::BlockIp,
                    config: HashMap::new(),
                    timeout_seconds: 30,
                    retry_count: 2,
                    retry_delay_seconds: 5,
                    continue_on_failure: false,
                    rollback: Some(Box::new(PlaybookAction {
                        id: "unblock".into(),
                        name: "Unblock source IP".into(),
                        kind: ActionKind::BlockIp,
                        config: HashMap::from([("operation".to_string(), "unblock".to_string())]),
                        timeout_seconds: 30,
                        retry_count: 0,
                        retry_delay_seconds: 0,
                        continue_on_failure: false,
                        rollback: None,
                    })),
                },
                PlaybookAction {
                    id: "disable-account".into(),
                    name: "Disable targeted account".into(),
                    kind: ActionKind::DisableUserAccount,
                    config: HashMap::new(),
                    timeout_seconds: 30,
                    retry_count: 1,
                    retry_delay_seconds: 5,
                    continue_on_failure: false,
                    rollback: None,
                },
                PlaybookAction {
                    id: "notify".into(),
                    name: "Notify SOC channel".into(),
                    kind: ActionKind::SlackNotification,
                    config: HashMap::from([("channel".to_string(), "#soc-alerts".to_string())]),
                    timeout_seconds: 10,
                    retry_count: 1,
                    retry_delay_seconds: 2,
                    continue_on_failure: true,
                    rollback: None,
                },
            ],
            requires_approval: false,
            auto_approve_severities: vec![],
            created_at: Utc::now(),
        });

        let _ = self.upsert(Playbook {
            id: "malware-containment".into(),
            name: "Malware Containment".into(),
            description: "Isolate the host, quarantine the sample, open a ticket".into(),
            enabled: true,
            trigger: PlaybookTrigger {
                severities: vec![Severity::Critical],
                mitre_tactics: vec!["TA0002".into()],
                rule_names: vec![],
                condition: None,
            },
            actions: vec![
                PlaybookAction {
                    id: "intel".into(),
                    name: "Check threat intelligence".into(),
                    kind: ActionKind::CheckThreatIntelligence,
                    config: HashMap::new(),
                    timeout_seconds: 15,
                    retry_count: 2,
                    retry_delay_seconds: 3,
                    continue_on_failure: true,
                    rollback: None,
                },
                PlaybookAction {
                    id: "isolate".into(),
                    name: "Isolate host".into(),
                    kind: ActionKind::IsolateHost,
                    config: HashMap::new(),
                    timeout_seconds: 60,
                    retry_count: 1,
                    retry_delay_seconds: 10,
                    continue_on_failure: false,
                    rollback: Some(Box::new(PlaybookAction {
                        id: "rejoin".into(),
                        name: "Release host isolation".into(),
                        kind: ActionKind::IsolateHost,
                        config: HashMap::from([("operation".to_string(), "release".to_string())]),
                        timeout_seconds: 60,
                        retry_count: 0,
                        retry_delay_seconds: 0,
                        continue_on_failure: false,
                        rollback: None,
                    })),
                },
                PlaybookAction {
                    id: "ticket".into(),
                    name: "Open incident ticket".into(),
                    kind: ActionKind::CreateTicket,
                    config: HashMap::from([("queue".to_string(), "SECOPS".to_string())]),
                    timeout_seconds: 30,
                    retry_count: 2,
                    retry_delay_seconds: 5,
                    continue_on_failure: true,
                    rollback: None,
                },
            ],
            requires_approval: true,
            auto_approve_severities: vec![Severity::Critical],
            created_at: Utc::now(),
        });
    }
}

impl Default for PlaybookStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siem_detect::AlertStatus;

    fn alert(severity: Severity, rule_name: &str, tactic: Option<&str>) -> Alert {
        let now = Utc::now();
        Alert {
            id: "a".into(),
            external_ref: "ALT-a".into(),
            rule_id: "rule-1".into(),
            rule_name: rule_name.into(),
            severity,
            title: rule_name.into(),
            description: String::new(),
            category: "authentication".into(),
            event_ids: vec!["e1".into()],
            event_count: 1,
            first_event_time: now,
            last_event_time: now,
            host: Some("ws-042".into()),
            subject_user: Some("jdoe".into()),
            source_ip: Some("10.0.0.7".into()),
            process_name: None,
            mitre_tactic: tactic.map(Into::into),
            mitre_technique: None,
            status: AlertStatus::New,
            incident_id: None,
            analysis: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn trigger_clauses_are_a_union() {
        let trigger = PlaybookTrigger {
            severities: vec![Severity::Critical],
            mitre_tactics: vec!["TA0006".into()],
            rule_names: vec!["Brute Force Logon".into()],
            condition: None,
        };
        assert!(trigger.matches_alert(&alert(Severity::Critical, "Other Rule", None)));
        assert!(trigger.matches_alert(&alert(Severity::Low, "Other Rule", Some("TA0006"))));
        assert!(trigger.matches_alert(&alert(Severity::Low, "Brute Force Logon", None)));
        assert!(!trigger.matches_alert(&alert(Severity::Low, "Other Rule", Some("TA0001"))));
    }

    #[test]
    fn empty_trigger_never_auto_fires() {
        let trigger = PlaybookTrigger::default();
        assert!(!trigger.matches_alert(&alert(Severity::Critical, "Any", Some("TA0006"))));
    }

    #[test]
    fn free_form_condition_over_context() {
        let trigger = PlaybookTrigger {
            condition: Some(TriggerCondition {
                field: "source_ip".into(),
                operator: ConditionOperator::Regex,
                value: r"^10\.0\.".into(),
            }),
            ..Default::default()
        };
        assert!(trigger.matches_alert(&alert(Severity::Low, "Any", None)));

        let no_match = PlaybookTrigger {
            condition: Some(TriggerCondition {
                field: "host".into(),
                operator: ConditionOperator::Equals,
                value: "dc-01".into(),
            }),
            ..Default::default()
        };
        assert!(!no_match.matches_alert(&alert(Severity::Low, "Any", None)));
    }

    #[test]
    fn validation_rejects_broken_playbooks() {
        let store = PlaybookStore::new();

        let no_actions = Playbook {
            id: "p1".into(),
            name: "empty".into(),
            description: String::new(),
            enabled: true,
            trigger: PlaybookTrigger::default(),
            actions: vec![],
            requires_approval: false,
            auto_approve_severities: vec![],
            created_at: Utc::now(),
        };
        assert!(store.upsert(no_actions).is_err());

        let zero_timeout = Playbook {
            id: "p2".into(),
            name: "bad timeout".into(),
            description: String::new(),
            enabled: true,
            trigger: PlaybookTrigger::default(),
            actions: vec![PlaybookAction {
                id: "a1".into(),
                name: "a1".into(),
                kind: ActionKind::BlockIp,
                config: HashMap::new(),
                timeout_seconds: 0,
                retry_count: 0,
                retry_delay_seconds: 0,
                continue_on_failure: false,
                rollback: None,
            }],
            requires_approval: false,
            auto_approve_severities: vec![],
            created_at: Utc::now(),
        };
        assert!(store.upsert(zero_timeout).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn seeded_defaults_load_clean() {
        let store = PlaybookStore::new();
        store.seed_defaults();
        assert_eq!(store.len(), 2);
        assert!(store.get("brute-force-containment").is_some());
        let malware = store.get("malware-containment").unwrap();
        assert!(malware.requires_approval);
        assert_eq!(malware.auto_approve_severities, vec![Severity::Critical]);
    }
}
