//! OpenSIEM Detection Engine
//!
//! Turns the normalized event stream into alerts and incidents:
//! - Rule store and typed rule definitions
//! - Rule evaluation (simple predicates, sliding-window thresholds,
//!   ordered-sequence correlation)
//! - Alert generation over an append-only store
//! - Incident grouping and auto-escalation
//! - Optional narrative enrichment
//!
//! # Architecture
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        DETECTION ENGINE                          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  events ──► Dedup ──► Rule Evaluator ──► Alert Generator         │
//! │                          │ windows            │                  │
//! │                          ▼                    ▼                  │
//! │                   Maintenance            Incident                │
//! │                     Sweeper             Correlator               │
//! │                                               │                  │
//! │                                               ▼                  │
//! │                                      AlertListener (SOAR)        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod alerts;
pub mod dedup;
pub mod enrichment;
pub mod evaluator;
pub mod incidents;
pub mod pipeline;
pub mod rules;
pub mod sweeper;

pub use alerts::{Alert, AlertGenerator, AlertStatus, AlertStore};
pub use enrichment::{EnrichError, NarrativeEnricher, TemplateEnricher};
pub use evaluator::{RuleEvaluator, RuleMatch};
pub use incidents::{
    CorrelationOutcome, Incident, IncidentCorrelator, IncidentStatus, TimelineEntry,
    TimelineEntryKind,
};
pub use pipeline::{AlertListener, DetectionConfig, DetectionPipeline, PipelineMetrics};
pub use rules::{
    CmpOp, DetectionRule, EscalationPolicy, Predicate, RuleFilters, RuleKind, RuleStats,
    RuleStatsSnapshot, RuleStore,
};
pub use sweeper::{Sweepable, SweeperConfig, SweeperHandle};
