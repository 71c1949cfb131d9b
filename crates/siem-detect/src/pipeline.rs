//! Detection Pipeline
//!
//! Unified path: Dedup → Evaluate → Alert → Incident → Enrich → Notify
//!
//! Every stage downstream of rule evaluation is failure-isolated: a
//! broken enricher, sink, or listener affects its own alert only and the
//! ingestion path keeps moving.

use crate::alerts::{Alert, AlertGenerator, AlertStore};
use crate::dedup::FingerprintWindow;
use crate::enrichment::NarrativeEnricher;
use crate::evaluator::RuleEvaluator;
use crate::incidents::{CorrelationOutcome, Incident, IncidentCorrelator};
use crate::rules::RuleStore;
use crate::sweeper::{self, Sweepable, SweeperConfig, SweeperHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use siem_common::NormalizedEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Downstream consumer of new alerts and incident updates; the SOAR
/// playbook matcher hangs off this.
#[async_trait]
pub trait AlertListener: Send + Sync {
    /// A new alert was created (incident linkage already applied).
    async fn on_alert(&self, alert: &Alert);
    /// An incident was created or gained an alert.
    async fn on_incident(&self, _incident: &Incident) {}
}

/// Immutable pipeline configuration, fixed at construction. Reloading
/// rules or settings means building a new pipeline.
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Drop exact duplicate deliveries before evaluation
    pub dedup_enabled: bool,
    /// Dedup fingerprint window, seconds
    pub dedup_window_secs: u64,
    /// Incident time-proximity window, seconds
    pub incident_proximity_secs: u64,
    /// Maintenance sweeper settings
    pub sweeper: SweeperConfig,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            dedup_enabled: true,
            dedup_window_secs: 300,
            incident_proximity_secs: 3600,
            sweeper: SweeperConfig::default(),
        }
    }
}

struct PipelineStats {
    events_received: AtomicU64,
    events_deduplicated: AtomicU64,
    events_processed: AtomicU64,
    alerts_generated: AtomicU64,
    processing_errors: AtomicU64,
}

/// Point-in-time pipeline counters.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetrics {
    /// Events received
    pub events_received: u64,
    /// Duplicate deliveries dropped
    pub events_deduplicated: u64,
    /// Events fully processed
    pub events_processed: u64,
    /// Alerts created
    pub alerts_generated: u64,
    /// Stage errors (isolated, not fatal)
    pub processing_errors: u64,
}

/// The detection engine: consumes normalized events, produces alerts and
/// incidents, and hands alerts to the response layer.
pub struct DetectionPipeline {
    config: DetectionConfig,
    rules: Arc<RuleStore>,
    evaluator: Arc<RuleEvaluator>,
    dedup: Arc<FingerprintWindow>,
    alerts: Arc<AlertStore>,
    generator: AlertGenerator,
    incidents: Arc<IncidentCorrelator>,
    enricher: Option<Arc<dyn NarrativeEnricher>>,
    listener: Option<Arc<dyn AlertListener>>,
    sink: Arc<dyn siem_common::NotificationSink>,
    stats: PipelineStats,
}

impl DetectionPipeline {
    /// Build the pipeline over a rule store. The evaluator compiles the
    /// store's current contents; call again after rule changes.
    pub fn new(
        config: DetectionConfig,
        rules: Arc<RuleStore>,
        sink: Arc<dyn siem_common::NotificationSink>,
        enricher: Option<Arc<dyn NarrativeEnricher>>,
        listener: Option<Arc<dyn AlertListener>>,
    ) -> Self {
        let evaluator = Arc::new(RuleEvaluator::compile(&rules));
        let alerts = Arc::new(AlertStore::new());
        let generator = AlertGenerator::new(Arc::clone(&alerts), Arc::clone(&rules), Arc::clone(&sink));
        let incidents = Arc::new(IncidentCorrelator::new(
            Arc::clone(&sink),
            config.incident_proximity_secs,
        ));
        let dedup = Arc::new(FingerprintWindow::new(config.dedup_window_secs));
        Self {
            config,
            rules,
            evaluator,
            dedup,
            alerts,
            generator,
            incidents,
            enricher,
            listener,
            sink,
            stats: PipelineStats {
                events_received: AtomicU64::new(0),
                events_deduplicated: AtomicU64::new(0),
                events_processed: AtomicU64::new(0),
                alerts_generated: AtomicU64::new(0),
                processing_errors: AtomicU64::new(0),
            },
        }
    }

    /// Process one normalized event; returns the alerts it produced.
    pub async fn process_event(&self, event: &NormalizedEvent) -> Vec<Alert> {
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);

        if self.config.dedup_enabled && self.dedup.is_duplicate(event) {
            self.stats.events_deduplicated.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(event_id = %event.id, "duplicate delivery dropped");
            return Vec::new();
        }

        let matches = self.evaluator.evaluate(event);
        let mut produced = Vec::with_capacity(matches.len());

        for m in matches {
            let mut alert = match self.generator.generate(&m).await {
                Ok(alert) => alert,
                Err(e) => {
                    self.stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(rule_id = %m.rule_id, error = %e, "alert generation failed");
                    continue;
                }
            };
            self.stats.alerts_generated.fetch_add(1, Ordering::Relaxed);

            self.correlate_incident(&mut alert).await;
            self.enrich(&mut alert).await;

            if let Some(listener) = &self.listener {
                listener.on_alert(&alert).await;
            }
            produced.push(alert);
        }

        self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
        produced
    }

    /// Process a batch of events in arrival order.
    pub async fn process_batch(&self, events: &[NormalizedEvent]) -> Vec<Alert> {
        let mut produced = Vec::new();
        for event in events {
            produced.extend(self.process_event(event).await);
        }
        produced
    }

    async fn correlate_incident(&self, alert: &mut Alert) {
        let escalation = self
            .rules
            .get(&alert.rule_id)
            .map(|r| r.escalation)
            .unwrap_or_default();

        let outcome = match self.incidents.correlate(alert, &escalation).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(alert_id = %alert.id, error = %e, "incident correlation failed");
                return;
            }
        };

        let incident_id = match outcome {
            CorrelationOutcome::Appended { incident_id }
            | CorrelationOutcome::Escalated { incident_id } => incident_id,
            CorrelationOutcome::Unmatched => return,
        };

        match self.alerts.link_incident(&alert.id, &incident_id) {
            Ok(_) => alert.incident_id = Some(incident_id.clone()),
            Err(e) => {
                self.stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(alert_id = %alert.id, error = %e, "incident linkage failed");
            }
        }

        if let (Some(listener), Some(incident)) = (&self.listener, self.incidents.get(&incident_id)) {
            listener.on_incident(&incident).await;
        }
    }

    async fn enrich(&self, alert: &mut Alert) {
        let Some(enricher) = &self.enricher else {
            return;
        };
        match enricher.narrate_alert(alert).await {
            Ok(text) => {
                if self.alerts.attach_analysis(&alert.id, text.clone()).is_ok() {
                    alert.analysis = Some(text);
                }
            }
            // Enrichment is best-effort by contract.
            Err(e) => {
                tracing::debug!(alert_id = %alert.id, error = %e, "enrichment unavailable");
            }
        }
    }

    /// Start the maintenance sweeper over the pipeline's windowed state.
    pub fn start_sweeper(&self) -> SweeperHandle {
        sweeper::spawn(
            self.config.sweeper,
            vec![
                Arc::clone(&self.evaluator) as Arc<dyn Sweepable>,
                Arc::clone(&self.dedup) as Arc<dyn Sweepable>,
            ],
        )
    }

    /// Shared alert store.
    pub fn alerts(&self) -> &Arc<AlertStore> {
        &self.alerts
    }

    /// Incident view.
    pub fn incidents(&self) -> &Arc<IncidentCorrelator> {
        &self.incidents
    }

    /// Alert generator (operator status changes go through it).
    pub fn generator(&self) -> &AlertGenerator {
        &self.generator
    }

    /// Notification sink shared with downstream engines.
    pub fn sink(&self) -> &Arc<dyn siem_common::NotificationSink> {
        &self.sink
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            events_received: self.stats.events_received.load(Ordering::Relaxed),
            events_deduplicated: self.stats.events_deduplicated.load(Ordering::Relaxed),
            events_processed: self.stats.events_processed.load(Ordering::Relaxed),
            alerts_generated: self.stats.alerts_generated.load(Ordering::Relaxed),
            processing_errors: self.stats.processing_errors.load(Ordering::Relaxed),
        }
    }
}

impl Sweepable for RuleEvaluator {
    fn name(&self) -> &'static str {
        "rule-evaluator-windows"
    }
    fn sweep(&self, now: DateTime<Utc>) {
        RuleEvaluator::sweep(self, now);
    }
}

impl Sweepable for FingerprintWindow {
    fn name(&self) -> &'static str {
        "dedup-fingerprints"
    }
    fn sweep(&self, now: DateTime<Utc>) {
        FingerprintWindow::sweep(self, now);
    }
}
