//! Incident Correlation & Escalation
//!
//! Groups related alerts into incidents: shared host, shared user, or
//! time proximity combined with MITRE kill-chain adjacency. Alerts that
//! match no open incident are escalated into a new incident when their
//! originating rule's policy says so.

use crate::alerts::Alert;
use crate::rules::EscalationPolicy;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use siem_common::{mitre, Notification, NotificationSink, Severity, SiemError, SiemResult};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Incident lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Newly opened
    Open,
    /// Under investigation
    Investigating,
    /// Threat contained, cleanup pending
    Contained,
    /// Resolved
    Resolved,
    /// Closed
    Closed,
}

impl IncidentStatus {
    /// Whether new alerts may still be grouped into the incident.
    pub fn accepts_alerts(self) -> bool {
        matches!(
            self,
            IncidentStatus::Open | IncidentStatus::Investigating | IncidentStatus::Contained
        )
    }

    /// Legal status transitions.
    pub fn can_transition_to(self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        matches!(
            (self, next),
            (Open, Investigating)
                | (Open, Contained)
                | (Open, Resolved)
                | (Open, Closed)
                | (Investigating, Contained)
                | (Investigating, Resolved)
                | (Investigating, Closed)
                | (Contained, Resolved)
                | (Contained, Closed)
                | (Resolved, Closed)
        )
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Contained => "contained",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Closed => "closed",
        }
    }
}

/// What happened to an incident, when, by whom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Entry id
    pub id: String,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// What happened
    pub kind: TimelineEntryKind,
    /// Free-form description
    pub description: String,
    /// Actor ("system" for automated entries)
    pub actor: String,
}

/// Timeline entry kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEntryKind {
    /// Incident opened
    Created,
    /// Alert grouped into the incident
    AlertLinked,
    /// Status changed
    StatusChanged,
    /// Operator note
    Note,
}

/// A grouping of related alerts representing one real-world security
/// event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    /// Incident id
    pub id: String,
    /// Stable external reference ("INC-xxxxxxxx")
    pub external_ref: String,
    /// Title, seeded from the first alert
    pub title: String,
    /// Max severity over contributing alerts
    pub severity: Severity,
    /// Lifecycle status
    pub status: IncidentStatus,
    /// Contributing alert ids
    pub alert_ids: Vec<String>,
    /// Contributing alert count
    pub alert_count: u64,
    /// Total contributing event count
    pub event_count: u64,
    /// Hosts touched by contributing alerts
    pub affected_hosts: BTreeSet<String>,
    /// Users touched by contributing alerts
    pub affected_users: BTreeSet<String>,
    /// MITRE tactics seen across contributing alerts
    pub mitre_tactics: BTreeSet<String>,
    /// Earliest contributing event time
    pub first_event_time: DateTime<Utc>,
    /// Latest contributing event time
    pub last_event_time: DateTime<Utc>,
    /// Audit timeline
    pub timeline: Vec<TimelineEntry>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

fn timeline_entry(kind: TimelineEntryKind, description: String, actor: &str) -> TimelineEntry {
    TimelineEntry {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        kind,
        description,
        actor: actor.to_string(),
    }
}

/// Outcome of correlating one alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationOutcome {
    /// Alert joined an existing open incident
    Appended {
        /// Incident joined
        incident_id: String,
    },
    /// Alert opened a new incident via the rule's escalation policy
    Escalated {
        /// Incident created
        incident_id: String,
    },
    /// Alert stands alone
    Unmatched,
}

/// Groups alerts into incidents and applies escalation policy.
pub struct IncidentCorrelator {
    incidents: DashMap<String, Incident>,
    sink: Arc<dyn NotificationSink>,
    /// Two alerts whose event windows are within this many seconds are
    /// "time proximate" for kill-chain grouping.
    proximity_secs: u64,
}

impl IncidentCorrelator {
    /// New correlator with the given time-proximity window.
    pub fn new(sink: Arc<dyn NotificationSink>, proximity_secs: u64) -> Self {
        Self {
            incidents: DashMap::new(),
            sink,
            proximity_secs,
        }
    }

    /// Correlate one alert against open incidents. Idempotent: an alert
    /// already linked (or already present in an incident) is a no-op.
    pub async fn correlate(
        &self,
        alert: &Alert,
        escalation: &EscalationPolicy,
    ) -> SiemResult<CorrelationOutcome> {
        if let Some(incident_id) = &alert.incident_id {
            return Ok(CorrelationOutcome::Appended {
                incident_id: incident_id.clone(),
            });
        }

        if let Some(incident_id) = self.find_matching_incident(alert) {
            let appended = self.append_alert(&incident_id, alert)?;
            if appended {
                let (alert_count, severity) = {
                    let incident = self.incidents.get(&incident_id).ok_or(SiemError::NotFound {
                        kind: "incident",
                        id: incident_id.clone(),
                    })?;
                    (incident.alert_count, incident.severity)
                };
                tracing::info!(
                    incident_id = %incident_id,
                    alert_id = %alert.id,
                    alert_count,
                    severity = %severity,
                    "alert grouped into incident"
                );
                self.sink
                    .publish(Notification::IncidentUpdated {
                        incident_id: incident_id.clone(),
                        alert_count,
                    })
                    .await;
            }
            return Ok(CorrelationOutcome::Appended { incident_id });
        }

        if escalation.should_escalate(alert.severity, &alert.category) {
            let incident = self.open_incident(alert);
            let incident_id = incident.id.clone();
            tracing::info!(
                incident_id = %incident_id,
                alert_id = %alert.id,
                severity = %incident.severity,
                "incident opened from alert"
            );
            self.sink
                .publish(Notification::IncidentCreated {
                    incident_id: incident_id.clone(),
                    severity: incident.severity,
                })
                .await;
            return Ok(CorrelationOutcome::Escalated { incident_id });
        }

        Ok(CorrelationOutcome::Unmatched)
    }

    fn find_matching_incident(&self, alert: &Alert) -> Option<String> {
        let proximity = Duration::seconds(self.proximity_secs as i64);
        self.incidents
            .iter()
            .filter(|i| i.status.accepts_alerts())
            .find(|i| {
                let shared_host = alert
                    .host
                    .as_ref()
                    .map(|h| i.affected_hosts.contains(h))
                    .unwrap_or(false);
                let shared_user = alert
                    .subject_user
                    .as_ref()
                    .map(|u| i.affected_users.contains(u))
                    .unwrap_or(false);
                let proximate = alert.first_event_time <= i.last_event_time + proximity
                    && i.first_event_time <= alert.last_event_time + proximity;
                let chain_adjacent = alert
                    .mitre_tactic
                    .as_ref()
                    .map(|t| i.mitre_tactics.iter().any(|it| mitre::adjacent(t, it)))
                    .unwrap_or(false);
                shared_host || shared_user || (proximate && chain_adjacent)
            })
            .map(|i| i.id.clone())
    }

    /// Append an alert to an incident and recompute aggregates. Returns
    /// false when the alert was already present.
    fn append_alert(&self, incident_id: &str, alert: &Alert) -> SiemResult<bool> {
        let mut incident = self
            .incidents
            .get_mut(incident_id)
            .ok_or(SiemError::NotFound {
                kind: "incident",
                id: incident_id.to_string(),
            })?;
        if incident.alert_ids.iter().any(|id| id == &alert.id) {
            return Ok(false);
        }
        incident.alert_ids.push(alert.id.clone());
        incident.alert_count = incident.alert_ids.len() as u64;
        incident.event_count += alert.event_count;
        incident.severity = incident.severity.max(alert.severity);
        if let Some(host) = &alert.host {
            incident.affected_hosts.insert(host.clone());
        }
        if let Some(user) = &alert.subject_user {
            incident.affected_users.insert(user.clone());
        }
        if let Some(tactic) = &alert.mitre_tactic {
            incident.mitre_tactics.insert(tactic.clone());
        }
        if alert.first_event_time < incident.first_event_time {
            incident.first_event_time = alert.first_event_time;
        }
        if alert.last_event_time > incident.last_event_time {
            incident.last_event_time = alert.last_event_time;
        }
        incident.timeline.push(timeline_entry(
            TimelineEntryKind::AlertLinked,
            format!("alert {} linked", alert.external_ref),
            "system",
        ));
        incident.updated_at = Utc::now();
        Ok(true)
    }

    fn open_incident(&self, alert: &Alert) -> Incident {
        let id = uuid::Uuid::new_v4().to_string();
        let mut incident = Incident {
            external_ref: format!("INC-{}", &id[..8]),
            id,
            title: alert.title.clone(),
            severity: alert.severity,
            status: IncidentStatus::Open,
            alert_ids: vec![alert.id.clone()],
            alert_count: 1,
            event_count: alert.event_count,
            affected_hosts: BTreeSet::new(),
            affected_users: BTreeSet::new(),
            mitre_tactics: BTreeSet::new(),
            first_event_time: alert.first_event_time,
            last_event_time: alert.last_event_time,
            timeline: vec![timeline_entry(
                TimelineEntryKind::Created,
                format!("opened from alert {}", alert.external_ref),
                "system",
            )],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        if let Some(host) = &alert.host {
            incident.affected_hosts.insert(host.clone());
        }
        if let Some(user) = &alert.subject_user {
            incident.affected_users.insert(user.clone());
        }
        if let Some(tactic) = &alert.mitre_tactic {
            incident.mitre_tactics.insert(tactic.clone());
        }
        self.incidents.insert(incident.id.clone(), incident.clone());
        incident
    }

    /// Operator status change along the legal graph.
    pub fn update_status(
        &self,
        incident_id: &str,
        next: IncidentStatus,
        actor: &str,
    ) -> SiemResult<Incident> {
        let mut incident = self
            .incidents
            .get_mut(incident_id)
            .ok_or(SiemError::NotFound {
                kind: "incident",
                id: incident_id.to_string(),
            })?;
        if !incident.status.can_transition_to(next) {
            return Err(SiemError::IllegalStatusChange {
                from: incident.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        let from = incident.status;
        incident.status = next;
        incident.timeline.push(timeline_entry(
            TimelineEntryKind::StatusChanged,
            format!("{} -> {}", from.as_str(), next.as_str()),
            actor,
        ));
        incident.updated_at = Utc::now();
        Ok(incident.clone())
    }

    /// Fetch one incident.
    pub fn get(&self, incident_id: &str) -> Option<Incident> {
        self.incidents.get(incident_id).map(|i| i.clone())
    }

    /// Incidents still accepting alerts.
    pub fn open_incidents(&self) -> Vec<Incident> {
        self.incidents
            .iter()
            .filter(|i| i.status.accepts_alerts())
            .map(|i| i.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertStatus;
    use siem_common::NullSink;

    fn alert(id: &str, host: &str, user: &str, severity: Severity) -> Alert {
        let now = Utc::now();
        Alert {
            id: id.into(),
            external_ref: format!("ALT-{}", id),
            rule_id: "rule-1".into(),
            rule_name: "Brute Force".into(),
            severity,
            title: "Brute Force".into(),
            description: String::new(),
            category: "authentication".into(),
            event_ids: vec![format!("{}-e1", id)],
            event_count: 1,
            first_event_time: now,
            last_event_time: now,
            host: Some(host.into()),
            subject_user: Some(user.into()),
            source_ip: None,
            process_name: None,
            mitre_tactic: Some("TA0006".into()),
            mitre_technique: None,
            status: AlertStatus::New,
            incident_id: None,
            analysis: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn escalate_high() -> EscalationPolicy {
        EscalationPolicy {
            min_severity: Some(Severity::High),
            categories: vec![],
        }
    }

    #[tokio::test]
    async fn escalation_then_grouping_by_host() {
        let correlator = IncidentCorrelator::new(Arc::new(NullSink), 3600);

        let a = alert("a", "ws-042", "jdoe", Severity::High);
        let outcome = correlator.correlate(&a, &escalate_high()).await.unwrap();
        let incident_id = match outcome {
            CorrelationOutcome::Escalated { incident_id } => incident_id,
            other => panic!("expected escalation, got {:?}", other),
        };

        // Same host, lower severity: joins instead of escalating.
        let b = alert("b", "ws-042", "asmith", Severity::Low);
        let outcome = correlator.correlate(&b, &escalate_high()).await.unwrap();
        assert_eq!(
            outcome,
            CorrelationOutcome::Appended {
                incident_id: incident_id.clone()
            }
        );

        let incident = correlator.get(&incident_id).unwrap();
        assert_eq!(incident.alert_count, 2);
        assert_eq!(incident.severity, Severity::High);
        assert!(incident.affected_users.contains("asmith"));
        assert_eq!(incident.event_count, 2);
    }

    #[tokio::test]
    async fn severity_is_max_over_alerts() {
        let correlator = IncidentCorrelator::new(Arc::new(NullSink), 3600);
        let a = alert("a", "ws-042", "jdoe", Severity::High);
        let id = match correlator.correlate(&a, &escalate_high()).await.unwrap() {
            CorrelationOutcome::Escalated { incident_id } => incident_id,
            other => panic!("unexpected {:?}", other),
        };
        let b = alert("b", "ws-042", "jdoe", Severity::Critical);
        correlator.correlate(&b, &escalate_high()).await.unwrap();
        assert_eq!(correlator.get(&id).unwrap().severity, Severity::Critical);
    }

    #[tokio::test]
    async fn low_severity_unmatched_does_not_escalate() {
        let correlator = IncidentCorrelator::new(Arc::new(NullSink), 3600);
        let a = alert("a", "ws-042", "jdoe", Severity::Low);
        assert_eq!(
            correlator.correlate(&a, &escalate_high()).await.unwrap(),
            CorrelationOutcome::Unmatched
        );
        assert!(correlator.open_incidents().is_empty());
    }

    #[tokio::test]
    async fn reprocessing_same_alert_is_idempotent() {
        let correlator = IncidentCorrelator::new(Arc::new(NullSink), 3600);
        let a = alert("a", "ws-042", "jdoe", Severity::High);
        let id = match correlator.correlate(&a, &escalate_high()).await.unwrap() {
            CorrelationOutcome::Escalated { incident_id } => incident_id,
            other => panic!("unexpected {:?}", other),
        };

        // Replay before linkage was written back.
        correlator.correlate(&a, &escalate_high()).await.unwrap();
        assert_eq!(correlator.get(&id).unwrap().alert_count, 1);

        // Replay after linkage was written back.
        let mut linked = a.clone();
        linked.incident_id = Some(id.clone());
        let outcome = correlator.correlate(&linked, &escalate_high()).await.unwrap();
        assert_eq!(outcome, CorrelationOutcome::Appended { incident_id: id.clone() });
        assert_eq!(correlator.get(&id).unwrap().alert_count, 1);
    }

    #[tokio::test]
    async fn kill_chain_proximity_groups_without_shared_context() {
        let correlator = IncidentCorrelator::new(Arc::new(NullSink), 3600);
        let a = alert("a", "ws-042", "jdoe", Severity::High);
        let id = match correlator.correlate(&a, &escalate_high()).await.unwrap() {
            CorrelationOutcome::Escalated { incident_id } => incident_id,
            other => panic!("unexpected {:?}", other),
        };

        // Different host and user, adjacent tactic (Credential Access ->
        // Discovery), close in time.
        let mut b = alert("b", "dc-01", "asmith", Severity::Medium);
        b.mitre_tactic = Some("TA0007".into());
        let outcome = correlator.correlate(&b, &escalate_high()).await.unwrap();
        assert_eq!(outcome, CorrelationOutcome::Appended { incident_id: id });
    }

    #[tokio::test]
    async fn closed_incident_does_not_accept_alerts() {
        let correlator = IncidentCorrelator::new(Arc::new(NullSink), 3600);
        let a = alert("a", "ws-042", "jdoe", Severity::High);
        let id = match correlator.correlate(&a, &escalate_high()).await.unwrap() {
            CorrelationOutcome::Escalated { incident_id } => incident_id,
            other => panic!("unexpected {:?}", other),
        };
        correlator
            .update_status(&id, IncidentStatus::Resolved, "analyst")
            .unwrap();

        let b = alert("b", "ws-042", "jdoe", Severity::High);
        let outcome = correlator.correlate(&b, &escalate_high()).await.unwrap();
        match outcome {
            CorrelationOutcome::Escalated { incident_id } => assert_ne!(incident_id, id),
            other => panic!("expected a fresh incident, got {:?}", other),
        }
    }

    #[test]
    fn status_transition_graph() {
        let correlator = IncidentCorrelator::new(Arc::new(NullSink), 3600);
        let a = alert("a", "ws-042", "jdoe", Severity::High);
        let incident = correlator.open_incident(&a);
        assert!(correlator
            .update_status(&incident.id, IncidentStatus::Investigating, "analyst")
            .is_ok());
        assert!(correlator
            .update_status(&incident.id, IncidentStatus::Open, "analyst")
            .is_err());
        let updated = correlator
            .update_status(&incident.id, IncidentStatus::Resolved, "analyst")
            .unwrap();
        assert_eq!(updated.timeline.len(), 3); // created + two status changes
    }
}
