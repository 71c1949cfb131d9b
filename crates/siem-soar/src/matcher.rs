//! Playbook Matcher
//!
//! Evaluates every enabled playbook's trigger against new alerts and
//! incidents and asks the execution engine to start matching runs. A
//! duplicate (playbook, alert) request is the engine's call to reject;
//! here it is counted and logged, never fatal.

use crate::executor::{ExecutionEngine, ExecutionTrigger};
use crate::playbook::PlaybookStore;
use async_trait::async_trait;
use serde::Serialize;
use siem_common::SiemError;
use siem_detect::{Alert, AlertListener, Incident};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct MatcherStats {
    alerts_seen: AtomicU64,
    executions_started: AtomicU64,
    duplicates_rejected: AtomicU64,
    start_errors: AtomicU64,
}

/// Point-in-time matcher counters.
#[derive(Debug, Clone, Serialize)]
pub struct MatcherMetrics {
    pub alerts_seen: u64,
    pub executions_started: u64,
    pub duplicates_rejected: u64,
    pub start_errors: u64,
}

/// Connects the detection pipeline to the execution engine.
pub struct PlaybookMatcher {
    playbooks: Arc<PlaybookStore>,
    engine: Arc<ExecutionEngine>,
    stats: MatcherStats,
}

impl PlaybookMatcher {
    /// New matcher over the shared playbook store and engine.
    pub fn new(playbooks: Arc<PlaybookStore>, engine: Arc<ExecutionEngine>) -> Self {
        Self {
            playbooks,
            engine,
            stats: MatcherStats {
                alerts_seen: AtomicU64::new(0),
                executions_started: AtomicU64::new(0),
                duplicates_rejected: AtomicU64::new(0),
                start_errors: AtomicU64::new(0),
            },
        }
    }

    /// Evaluate triggers for one alert and start matching playbooks.
    pub async fn handle_alert(&self, alert: &Alert) {
        self.stats.alerts_seen.fetch_add(1, Ordering::Relaxed);
        for playbook in self.playbooks.enabled() {
            if !playbook.trigger.matches_alert(alert) {
                continue;
            }
            match self
                .engine
                .start(&playbook.id, ExecutionTrigger::Alert(Box::new(alert.clone())))
                .await
            {
                Ok(execution_id) => {
                    self.stats.executions_started.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        playbook_id = %playbook.id,
                        alert_id = %alert.id,
                        execution_id = %execution_id,
                        "playbook triggered"
                    );
                }
                Err(SiemError::DuplicateExecution { .. }) => {
                    self.stats.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        playbook_id = %playbook.id,
                        alert_id = %alert.id,
                        "execution already active, skipping"
                    );
                }
                Err(e) => {
                    self.stats.start_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        playbook_id = %playbook.id,
                        alert_id = %alert.id,
                        error = %e,
                        "playbook start failed"
                    );
                }
            }
        }
    }

    /// Evaluate triggers for an incident.
    pub async fn handle_incident(&self, incident: &Incident) {
        for playbook in self.playbooks.enabled() {
            if !playbook.trigger.matches_incident(incident) {
                continue;
            }
            match self
                .engine
                .start(
                    &playbook.id,
                    ExecutionTrigger::Incident {
                        incident_id: incident.id.clone(),
                        severity: incident.severity,
                    },
                )
                .await
            {
                Ok(_) => {
                    self.stats.executions_started.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.start_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        playbook_id = %playbook.id,
                        incident_id = %incident.id,
                        error = %e,
                        "playbook start failed"
                    );
                }
            }
        }
    }

    /// Run a playbook on operator request, outside any trigger.
    pub async fn manual_trigger(&self, playbook_id: &str, actor: &str) -> Result<String, SiemError> {
        self.engine
            .start(
                playbook_id,
                ExecutionTrigger::Manual {
                    actor: actor.to_string(),
                },
            )
            .await
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MatcherMetrics {
        MatcherMetrics {
            alerts_seen: self.stats.alerts_seen.load(Ordering::Relaxed),
            executions_started: self.stats.executions_started.load(Ordering::Relaxed),
            duplicates_rejected: self.stats.duplicates_rejected.load(Ordering::Relaxed),
            start_errors: self.stats.start_errors.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl AlertListener for PlaybookMatcher {
    async fn on_alert(&self, alert: &Alert) {
        self.handle_alert(alert).await;
    }

    async fn on_incident(&self, incident: &Incident) {
        self.handle_incident(incident).await;
    }
}
