//! Narrative Enrichment
//!
//! Optional AI-assisted analysis attached to alerts after creation. The
//! provider is an external collaborator; a missing or failing provider
//! must never block the detection path.

use crate::alerts::Alert;
use async_trait::async_trait;
use thiserror::Error;

/// Enrichment provider failure.
#[derive(Debug, Error)]
pub enum EnrichError {
    /// Provider not configured or unreachable
    #[error("enrichment provider unavailable: {0}")]
    Unavailable(String),
    /// Provider answered but the response was unusable
    #[error("enrichment response invalid: {0}")]
    InvalidResponse(String),
}

/// External analysis provider contract.
#[async_trait]
pub trait NarrativeEnricher: Send + Sync {
    /// Produce a human-readable analysis of the alert.
    async fn narrate_alert(&self, alert: &Alert) -> Result<String, EnrichError>;
}

/// Built-in provider that summarizes from the alert's own fields, used
/// when no external provider is configured.
#[derive(Default)]
pub struct TemplateEnricher;

#[async_trait]
impl NarrativeEnricher for TemplateEnricher {
    async fn narrate_alert(&self, alert: &Alert) -> Result<String, EnrichError> {
        let mut parts = vec![format!(
            "{} ({} severity): {} contributing event(s)",
            alert.title, alert.severity, alert.event_count
        )];
        if let Some(host) = &alert.host {
            parts.push(format!("host {}", host));
        }
        if let Some(user) = &alert.subject_user {
            parts.push(format!("user {}", user));
        }
        if let Some(technique) = &alert.mitre_technique {
            parts.push(format!("technique {}", technique));
        }
        Ok(parts.join(", "))
    }
}
