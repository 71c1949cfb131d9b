//! Alert Generation
//!
//! Materializes rule matches into alert records and owns the append-only
//! alert store. History never shrinks: contributing events only grow
//! until the alert reaches a terminal status, status changes follow the
//! legal transition graph, and nothing is deleted.

use crate::evaluator::RuleMatch;
use crate::rules::RuleStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use siem_common::{Notification, NotificationSink, Severity, SiemError, SiemResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Alert workflow status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Just created, untriaged
    New,
    /// Seen by an operator
    Acknowledged,
    /// Under active investigation
    Investigating,
    /// Closed as a real finding
    Resolved,
    /// Closed as noise
    FalsePositive,
}

impl AlertStatus {
    /// Terminal statuses freeze the alert's event set.
    pub fn is_terminal(self) -> bool {
        matches!(self, AlertStatus::Resolved | AlertStatus::FalsePositive)
    }

    /// Legal status transitions.
    pub fn can_transition_to(self, next: AlertStatus) -> bool {
        use AlertStatus::*;
        matches!(
            (self, next),
            (New, Acknowledged)
                | (New, Investigating)
                | (New, Resolved)
                | (New, FalsePositive)
                | (Acknowledged, Investigating)
                | (Acknowledged, Resolved)
                | (Acknowledged, FalsePositive)
                | (Investigating, Resolved)
                | (Investigating, FalsePositive)
        )
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::New => "new",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Investigating => "investigating",
            AlertStatus::Resolved => "resolved",
            AlertStatus::FalsePositive => "false_positive",
        }
    }
}

/// A single detection output from one rule match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Alert id
    pub id: String,
    /// Stable external reference shown to operators ("ALT-xxxxxxxx")
    pub external_ref: String,
    /// Originating rule id
    pub rule_id: String,
    /// Originating rule name
    pub rule_name: String,
    /// Severity copied from the rule
    pub severity: Severity,
    /// Title
    pub title: String,
    /// Description
    pub description: String,
    /// Category copied from the rule
    pub category: String,
    /// Contributing event ids, append-only until terminal
    pub event_ids: Vec<String>,
    /// Contributing event count
    pub event_count: u64,
    /// Earliest contributing event time
    pub first_event_time: DateTime<Utc>,
    /// Latest contributing event time
    pub last_event_time: DateTime<Utc>,
    /// Host context copied from the triggering event
    pub host: Option<String>,
    /// User context copied from the triggering event
    pub subject_user: Option<String>,
    /// Source IP context copied from the triggering event
    pub source_ip: Option<String>,
    /// Process context copied from the triggering event
    pub process_name: Option<String>,
    /// MITRE tactic copied from the rule
    pub mitre_tactic: Option<String>,
    /// MITRE technique copied from the rule
    pub mitre_technique: Option<String>,
    /// Workflow status
    pub status: AlertStatus,
    /// Incident this alert is linked to, if any
    pub incident_id: Option<String>,
    /// Optional narrative analysis attached after creation
    pub analysis: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

/// Append-only repository for alerts. Updates are restricted to status
/// transitions, event appends, incident linkage, and analysis
/// attachment; alerts are never removed.
pub struct AlertStore {
    alerts: DashMap<String, Alert>,
}

impl AlertStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            alerts: DashMap::new(),
        }
    }

    /// Insert a new alert. Duplicate ids are rejected.
    pub fn insert(&self, alert: Alert) -> SiemResult<()> {
        match self.alerts.entry(alert.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SiemError::AppendOnlyViolation {
                kind: "alert",
                id: alert.id,
                reason: "duplicate insert".into(),
            }),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(alert);
                Ok(())
            }
        }
    }

    /// Fetch one alert.
    pub fn get(&self, alert_id: &str) -> Option<Alert> {
        self.alerts.get(alert_id).map(|a| a.clone())
    }

    /// Change the alert's status along a legal edge. Returns the updated
    /// record.
    pub fn transition_status(&self, alert_id: &str, next: AlertStatus) -> SiemResult<Alert> {
        let mut alert = self.alerts.get_mut(alert_id).ok_or(SiemError::NotFound {
            kind: "alert",
            id: alert_id.to_string(),
        })?;
        if !alert.status.can_transition_to(next) {
            return Err(SiemError::IllegalStatusChange {
                from: alert.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        alert.status = next;
        alert.updated_at = Utc::now();
        Ok(alert.clone())
    }

    /// Append contributing events. Rejected once the alert is terminal.
    pub fn append_events(
        &self,
        alert_id: &str,
        event_ids: &[String],
        first_time: DateTime<Utc>,
        last_time: DateTime<Utc>,
    ) -> SiemResult<Alert> {
        let mut alert = self.alerts.get_mut(alert_id).ok_or(SiemError::NotFound {
            kind: "alert",
            id: alert_id.to_string(),
        })?;
        if alert.status.is_terminal() {
            return Err(SiemError::AppendOnlyViolation {
                kind: "alert",
                id: alert_id.to_string(),
                reason: "event append after terminal status".into(),
            });
        }
        for id in event_ids {
            if !alert.event_ids.contains(id) {
                alert.event_ids.push(id.clone());
            }
        }
        alert.event_count = alert.event_ids.len() as u64;
        if first_time < alert.first_event_time {
            alert.first_event_time = first_time;
        }
        if last_time > alert.last_event_time {
            alert.last_event_time = last_time;
        }
        alert.updated_at = Utc::now();
        Ok(alert.clone())
    }

    /// Link the alert to an incident. Idempotent for the same incident;
    /// re-linking to a different incident is rejected.
    pub fn link_incident(&self, alert_id: &str, incident_id: &str) -> SiemResult<bool> {
        let mut alert = self.alerts.get_mut(alert_id).ok_or(SiemError::NotFound {
            kind: "alert",
            id: alert_id.to_string(),
        })?;
        match &alert.incident_id {
            Some(existing) if existing == incident_id => Ok(false),
            Some(existing) => Err(SiemError::AppendOnlyViolation {
                kind: "alert",
                id: alert_id.to_string(),
                reason: format!("already linked to incident {}", existing),
            }),
            None => {
                alert.incident_id = Some(incident_id.to_string());
                alert.updated_at = Utc::now();
                Ok(true)
            }
        }
    }

    /// Attach narrative analysis text.
    pub fn attach_analysis(&self, alert_id: &str, analysis: String) -> SiemResult<()> {
        let mut alert = self.alerts.get_mut(alert_id).ok_or(SiemError::NotFound {
            kind: "alert",
            id: alert_id.to_string(),
        })?;
        alert.analysis = Some(analysis);
        alert.updated_at = Utc::now();
        Ok(())
    }

    /// Alerts in a non-terminal status.
    pub fn open_alerts(&self) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|a| !a.status.is_terminal())
            .map(|a| a.clone())
            .collect()
    }

    /// Total number of alerts ever stored.
    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

impl Default for AlertStore {
    fn default() -> Self {
        Self::new()
    }
}

struct GeneratorStats {
    alerts_created: AtomicU64,
}

/// Turns rule matches into stored alerts and keeps rule counters current.
pub struct AlertGenerator {
    store: Arc<AlertStore>,
    rules: Arc<RuleStore>,
    sink: Arc<dyn NotificationSink>,
    stats: GeneratorStats,
}

impl AlertGenerator {
    /// New generator over the shared stores.
    pub fn new(store: Arc<AlertStore>, rules: Arc<RuleStore>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            store,
            rules,
            sink,
            stats: GeneratorStats {
                alerts_created: AtomicU64::new(0),
            },
        }
    }

    /// Materialize one rule match into an alert.
    pub async fn generate(&self, m: &RuleMatch) -> SiemResult<Alert> {
        let id = uuid::Uuid::new_v4().to_string();
        let alert = Alert {
            external_ref: format!("ALT-{}", &id[..8]),
            id,
            rule_id: m.rule_id.clone(),
            rule_name: m.rule_name.clone(),
            severity: m.severity,
            title: m.rule_name.clone(),
            description: m.description.clone(),
            category: m.category.clone(),
            event_ids: m.event_ids.clone(),
            event_count: m.event_ids.len() as u64,
            first_event_time: m.first_event_time,
            last_event_time: m.last_event_time,
            host: m.trigger.host.clone(),
            subject_user: m.trigger.subject_user.clone(),
            source_ip: m.trigger.source_ip.clone(),
            process_name: m.trigger.process_name.clone(),
            mitre_tactic: m.mitre_tactic.clone(),
            mitre_technique: m.mitre_technique.clone(),
            status: AlertStatus::New,
            incident_id: None,
            analysis: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        self.store.insert(alert.clone())?;
        if let Some(stats) = self.rules.stats(&m.rule_id) {
            stats.record_match(m.last_event_time);
        }
        self.stats.alerts_created.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            alert_id = %alert.id,
            rule_id = %alert.rule_id,
            severity = %alert.severity,
            events = alert.event_count,
            "alert created"
        );
        self.sink
            .publish(Notification::AlertCreated {
                alert_id: alert.id.clone(),
                severity: alert.severity,
                title: alert.title.clone(),
            })
            .await;

        Ok(alert)
    }

    /// Operator status change; false-positive verdicts feed back into the
    /// rule's counters.
    pub async fn set_status(&self, alert_id: &str, next: AlertStatus) -> SiemResult<Alert> {
        let alert = self.store.transition_status(alert_id, next)?;
        if next == AlertStatus::FalsePositive {
            if let Some(stats) = self.rules.stats(&alert.rule_id) {
                stats.record_false_positive();
            }
        }
        self.sink
            .publish(Notification::AlertStatusChanged {
                alert_id: alert.id.clone(),
                status: next.as_str().to_string(),
            })
            .await;
        Ok(alert)
    }

    /// Alerts created since construction.
    pub fn alerts_created(&self) -> u64 {
        self.stats.alerts_created.load(Ordering::Relaxed)
    }
}
