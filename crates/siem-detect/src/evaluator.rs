//! Rule Evaluator
//!
//! Evaluates normalized events against the compiled rule set. Windowed
//! state (threshold counters, correlation partial matches) is keyed by
//! `(rule id, group-by values)` and serialized per key; different keys
//! evaluate concurrently. All window arithmetic uses event time, so a
//! replayed event stream produces the same alerts.

use crate::rules::{DetectionRule, Predicate, RuleKind, RuleStore};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use siem_common::NormalizedEvent;
use std::collections::VecDeque;

/// One rule match produced by the evaluator.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    /// Originating rule id
    pub rule_id: String,
    /// Originating rule name
    pub rule_name: String,
    /// Rule description
    pub description: String,
    /// Severity to stamp on the alert
    pub severity: siem_common::Severity,
    /// Category to stamp on the alert
    pub category: String,
    /// MITRE tactic from the rule
    pub mitre_tactic: Option<String>,
    /// MITRE technique from the rule
    pub mitre_technique: Option<String>,
    /// Contributing event ids, in arrival order
    pub event_ids: Vec<String>,
    /// Earliest contributing event time
    pub first_event_time: DateTime<Utc>,
    /// Latest contributing event time
    pub last_event_time: DateTime<Utc>,
    /// The event that completed the match; alert context is copied from it
    pub trigger: NormalizedEvent,
}

struct ThresholdState {
    hits: VecDeque<(DateTime<Utc>, String)>,
    suppressed_until: Option<DateTime<Utc>>,
    last_activity: DateTime<Utc>,
    window_secs: u64,
}

struct SequenceState {
    next_step: usize,
    first_time: DateTime<Utc>,
    event_ids: Vec<String>,
    last_activity: DateTime<Utc>,
    window_secs: u64,
}

/// Event evaluator over a compiled snapshot of the rule store.
///
/// The evaluator compiles enabled rules at construction; reloading rules
/// means building a new evaluator, not mutating this one.
pub struct RuleEvaluator {
    compiled: Vec<DetectionRule>,
    thresholds: DashMap<String, Mutex<ThresholdState>>,
    sequences: DashMap<String, Mutex<SequenceState>>,
}

impl RuleEvaluator {
    /// Compile the store's enabled rules. Rule kinds this engine cannot
    /// evaluate (sigma, ml) are dropped here with a warning.
    pub fn compile(store: &RuleStore) -> Self {
        let mut compiled = Vec::new();
        for rule in store.enabled_ordered() {
            match rule.kind {
                RuleKind::Sigma { .. } | RuleKind::Ml { .. } => {
                    tracing::warn!(rule_id = %rule.id, "rule kind not supported by this evaluator, skipping");
                }
                _ => compiled.push(rule),
            }
        }
        tracing::info!(rules = compiled.len(), "compiled rule set");
        Self {
            compiled,
            thresholds: DashMap::new(),
            sequences: DashMap::new(),
        }
    }

    /// Number of rules this evaluator runs per event.
    pub fn rule_count(&self) -> usize {
        self.compiled.len()
    }

    /// Evaluate one event against every compiled rule, in priority order.
    pub fn evaluate(&self, event: &NormalizedEvent) -> Vec<RuleMatch> {
        let mut matches = Vec::new();
        for rule in &self.compiled {
            if !rule.filters.accepts(event) {
                continue;
            }
            if let Some(exception) = &rule.exception {
                if exception.matches(event) {
                    tracing::debug!(rule_id = %rule.id, event_id = %event.id, "whitelisted");
                    continue;
                }
            }
            if let Some(m) = self.eval_rule(rule, event) {
                matches.push(m);
            }
        }
        matches
    }

    fn eval_rule(&self, rule: &DetectionRule, event: &NormalizedEvent) -> Option<RuleMatch> {
        match &rule.kind {
            RuleKind::Simple { predicate } => {
                if predicate.matches(event) {
                    Some(self.single_event_match(rule, event))
                } else {
                    None
                }
            }
            RuleKind::Threshold {
                predicate,
                window_secs,
                threshold,
                group_by,
            } => self.eval_threshold(rule, event, predicate, *window_secs, *threshold, group_by),
            RuleKind::Correlation {
                sequence,
                window_secs,
                group_by,
            } => self.eval_sequence(rule, event, sequence, *window_secs, group_by),
            // Filtered out at compile time
            RuleKind::Sigma { .. } | RuleKind::Ml { .. } => None,
        }
    }

    fn single_event_match(&self, rule: &DetectionRule, event: &NormalizedEvent) -> RuleMatch {
        RuleMatch {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            description: rule.description.clone(),
            severity: rule.severity,
            category: rule.category.clone(),
            mitre_tactic: rule.mitre_tactic.clone(),
            mitre_technique: rule.mitre_technique.clone(),
            event_ids: vec![event.id.clone()],
            first_event_time: event.event_time,
            last_event_time: event.event_time,
            trigger: event.clone(),
        }
    }

    fn eval_threshold(
        &self,
        rule: &DetectionRule,
        event: &NormalizedEvent,
        predicate: &Predicate,
        window_secs: u64,
        threshold: u64,
        group_by: &[String],
    ) -> Option<RuleMatch> {
        if !predicate.matches(event) {
            return None;
        }
        let key = state_key(&rule.id, group_by, event);
        let entry = self.thresholds.entry(key).or_insert_with(|| {
            Mutex::new(ThresholdState {
                hits: VecDeque::new(),
                suppressed_until: None,
                last_activity: event.event_time,
                window_secs,
            })
        });
        let mut state = entry.lock();
        state.last_activity = event.event_time;

        // Cooldown after a fire: events inside it neither fire nor seed
        // the next window.
        if let Some(until) = state.suppressed_until {
            if event.event_time < until {
                return None;
            }
            state.suppressed_until = None;
        }

        let window = Duration::seconds(window_secs as i64);
        let cutoff = event.event_time - window;
        while let Some((t, _)) = state.hits.front() {
            if *t <= cutoff {
                state.hits.pop_front();
            } else {
                break;
            }
        }
        state.hits.push_back((event.event_time, event.id.clone()));

        if (state.hits.len() as u64) < threshold {
            return None;
        }

        let first_event_time = state.hits.front().map(|(t, _)| *t).unwrap_or(event.event_time);
        let event_ids: Vec<String> = state.hits.drain(..).map(|(_, id)| id).collect();
        state.suppressed_until = Some(event.event_time + window);

        Some(RuleMatch {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            description: rule.description.clone(),
            severity: rule.severity,
            category: rule.category.clone(),
            mitre_tactic: rule.mitre_tactic.clone(),
            mitre_technique: rule.mitre_technique.clone(),
            event_ids,
            first_event_time,
            last_event_time: event.event_time,
            trigger: event.clone(),
        })
    }

    fn eval_sequence(
        &self,
        rule: &DetectionRule,
        event: &NormalizedEvent,
        sequence: &[Predicate],
        window_secs: u64,
        group_by: &[String],
    ) -> Option<RuleMatch> {
        let key = state_key(&rule.id, group_by, event);
        let window = Duration::seconds(window_secs as i64);

        let entry = self.sequences.entry(key.clone()).or_insert_with(|| {
            Mutex::new(SequenceState {
                next_step: 0,
                first_time: event.event_time,
                event_ids: Vec::new(),
                last_activity: event.event_time,
                window_secs,
            })
        });
        let mut state = entry.lock();
        state.last_activity = event.event_time;

        // Partial match expired: start over.
        if state.next_step > 0 && event.event_time - state.first_time > window {
            state.next_step = 0;
            state.event_ids.clear();
        }

        let step = match sequence.get(state.next_step) {
            Some(step) => step,
            None => {
                // Stale completed state; reset and retry this event.
                state.next_step = 0;
                state.event_ids.clear();
                sequence.first()?
            }
        };

        if !step.matches(event) {
            return None;
        }
        if state.next_step == 0 {
            state.first_time = event.event_time;
        }
        state.event_ids.push(event.id.clone());
        state.next_step += 1;

        if state.next_step < sequence.len() {
            return None;
        }

        let first_event_time = state.first_time;
        let event_ids = std::mem::take(&mut state.event_ids);
        state.next_step = 0;
        drop(state);
        drop(entry);
        self.sequences.remove(&key);

        Some(RuleMatch {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            description: rule.description.clone(),
            severity: rule.severity,
            category: rule.category.clone(),
            mitre_tactic: rule.mitre_tactic.clone(),
            mitre_technique: rule.mitre_technique.clone(),
            event_ids,
            first_event_time,
            last_event_time: event.event_time,
            trigger: event.clone(),
        })
    }

    /// Drop window state with no recent activity. Called by the
    /// maintenance sweeper.
    pub fn sweep(&self, now: DateTime<Utc>) {
        self.thresholds.retain(|_, state| {
            let state = state.lock();
            let ttl = Duration::seconds((state.window_secs * 2) as i64);
            now - state.last_activity <= ttl
        });
        self.sequences.retain(|_, state| {
            let state = state.lock();
            let ttl = Duration::seconds((state.window_secs * 2) as i64);
            now - state.last_activity <= ttl
        });
    }

    /// Live window-state entry count (both kinds), for stats.
    pub fn window_state_len(&self) -> usize {
        self.thresholds.len() + self.sequences.len()
    }
}

fn state_key(rule_id: &str, group_by: &[String], event: &NormalizedEvent) -> String {
    let mut key = String::from(rule_id);
    for field in group_by {
        key.push(':');
        match event.field(field) {
            Some(v) => key.push_str(&v),
            None => key.push('-'),
        }
    }
    key
}
