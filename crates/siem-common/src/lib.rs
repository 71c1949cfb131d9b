//! OpenSIEM Common - Shared types for the detection and response core
//!
//! This crate provides the primitives shared by the detection engine and
//! the SOAR engine:
//! - Normalized security event model
//! - Severity scale
//! - MITRE ATT&CK labels
//! - Error taxonomy
//! - Notification sink contract

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod notify;

pub use error::*;
pub use notify::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Alert/rule severity on the 0-4 scale used across the platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Informational, no operator attention needed
    Info = 0,
    /// Low severity
    Low = 1,
    /// Medium severity
    Medium = 2,
    /// High severity
    High = 3,
    /// Critical severity, immediate response expected
    Critical = 4,
}

impl Severity {
    /// Map a numeric rule severity (0-4) onto the scale. Out-of-range
    /// values clamp to `Critical`.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Severity::Info,
            1 => Severity::Low,
            2 => Severity::Medium,
            3 => Severity::High,
            _ => Severity::Critical,
        }
    }

    /// Numeric level of this severity.
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// A normalized security event as supplied by the collection subsystem.
///
/// Collectors (endpoint agents, network monitors) flatten their native
/// formats into this shape before the event reaches the rule evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Unique event id
    pub id: String,
    /// When the event occurred at the source
    pub event_time: DateTime<Utc>,
    /// Collector source type (e.g. "windows_security", "syslog", "netflow")
    pub source_type: String,
    /// Source-native event code (e.g. "4625" for a failed Windows logon)
    pub event_code: String,
    /// Severity as assessed by the collector
    pub severity: Severity,
    /// Event category (e.g. "authentication", "process", "network")
    pub category: String,
    /// Host the event originated on
    pub host: Option<String>,
    /// User the event concerns
    pub subject_user: Option<String>,
    /// Source IP address
    pub source_ip: Option<String>,
    /// Target IP address
    pub target_ip: Option<String>,
    /// Process name, when applicable
    pub process_name: Option<String>,
    /// MITRE ATT&CK tactic label, when the collector maps one
    pub mitre_tactic: Option<String>,
    /// MITRE ATT&CK technique label, when the collector maps one
    pub mitre_technique: Option<String>,
    /// Source-specific fields that survived normalization
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl NormalizedEvent {
    /// Look up an event field by name, as used by rule predicates and
    /// group-by keys. Well-known fields resolve to their typed columns,
    /// anything else falls through to `extra`.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "source_type" => Some(self.source_type.clone()),
            "event_code" => Some(self.event_code.clone()),
            "severity" => Some(self.severity.level().to_string()),
            "category" => Some(self.category.clone()),
            "host" => self.host.clone(),
            "subject_user" => self.subject_user.clone(),
            "source_ip" => self.source_ip.clone(),
            "target_ip" => self.target_ip.clone(),
            "process_name" => self.process_name.clone(),
            "mitre_tactic" => self.mitre_tactic.clone(),
            "mitre_technique" => self.mitre_technique.clone(),
            _ => self.extra.get(name).map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        }
    }
}

/// MITRE ATT&CK tactic helpers.
pub mod mitre {
    /// Well-known tactic ids in kill-chain order, used for proximity
    /// grouping of alerts into incidents.
    pub const KILL_CHAIN: &[&str] = &[
        "TA0043", // Reconnaissance
        "TA0042", // Resource Development
        "TA0001", // Initial Access
        "TA0002", // Execution
        "TA0003", // Persistence
        "TA0004", // Privilege Escalation
        "TA0005", // Defense Evasion
        "TA0006", // Credential Access
        "TA0007", // Discovery
        "TA0008", // Lateral Movement
        "TA0009", // Collection
        "TA0011", // Command and Control
        "TA0010", // Exfiltration
        "TA0040", // Impact
    ];

    /// Position of a tactic in the kill chain, if known.
    pub fn kill_chain_index(tactic: &str) -> Option<usize> {
        KILL_CHAIN.iter().position(|t| *t == tactic)
    }

    /// Whether two tactics are adjacent (within one step) in the kill
    /// chain. Unknown tactics are never adjacent.
    pub fn adjacent(a: &str, b: &str) -> bool {
        match (kill_chain_index(a), kill_chain_index(b)) {
            (Some(x), Some(y)) => x.abs_diff(y) <= 1,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> NormalizedEvent {
        NormalizedEvent {
            id: "evt-1".into(),
            event_time: Utc::now(),
            source_type: "windows_security".into(),
            event_code: "4625".into(),
            severity: Severity::Medium,
            category: "authentication".into(),
            host: Some("ws-042".into()),
            subject_user: Some("jdoe".into()),
            source_ip: Some("10.0.0.7".into()),
            target_ip: None,
            process_name: None,
            mitre_tactic: Some("TA0006".into()),
            mitre_technique: Some("T1110".into()),
            extra: HashMap::from([("logon_type".to_string(), serde_json::json!(3))]),
        }
    }

    #[test]
    fn severity_ordering_and_levels() {
        assert!(Severity::Critical > Severity::High);
        assert_eq!(Severity::from_level(3), Severity::High);
        assert_eq!(Severity::from_level(9), Severity::Critical);
        assert_eq!(Severity::High.level(), 3);
    }

    #[test]
    fn field_lookup_resolves_columns_and_extra() {
        let event = sample_event();
        assert_eq!(event.field("subject_user").as_deref(), Some("jdoe"));
        assert_eq!(event.field("severity").as_deref(), Some("2"));
        assert_eq!(event.field("logon_type").as_deref(), Some("3"));
        assert_eq!(event.field("no_such_field"), None);
    }

    #[test]
    fn kill_chain_adjacency() {
        assert!(mitre::adjacent("TA0006", "TA0006"));
        assert!(mitre::adjacent("TA0001", "TA0002"));
        assert!(!mitre::adjacent("TA0001", "TA0040"));
        assert!(!mitre::adjacent("TA0001", "TA9999"));
    }
}
