//! Fire-and-forget notification fan-out
//!
//! The detection and SOAR engines publish state changes to a
//! [`NotificationSink`]; delivery (websocket push, email, chat) lives in
//! external integrations. Sink failures are logged and never propagate
//! back into the processing path.

use crate::Severity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A state change worth pushing to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Notification {
    /// A new alert was created
    AlertCreated {
        /// Alert id
        alert_id: String,
        /// Alert severity
        severity: Severity,
        /// Alert title
        title: String,
    },
    /// An alert changed status
    AlertStatusChanged {
        /// Alert id
        alert_id: String,
        /// New status, stringly so the sink needs no model dependency
        status: String,
    },
    /// A new incident was opened
    IncidentCreated {
        /// Incident id
        incident_id: String,
        /// Incident severity
        severity: Severity,
    },
    /// An incident gained an alert or changed aggregates
    IncidentUpdated {
        /// Incident id
        incident_id: String,
        /// Current alert count
        alert_count: u64,
    },
    /// A playbook execution changed status
    ExecutionStatusChanged {
        /// Execution id
        execution_id: String,
        /// Playbook id
        playbook_id: String,
        /// New status
        status: String,
    },
}

/// Push-notification channel consumed by the UI layer.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification. Implementations must not block the
    /// caller for longer than a send; errors are theirs to swallow.
    async fn publish(&self, notification: Notification);
}

/// Default sink: emits notifications to the tracing log.
#[derive(Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn publish(&self, notification: Notification) {
        tracing::info!(?notification, "notification");
    }
}

/// Sink that drops everything, for tests and detached deployments.
#[derive(Default)]
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn publish(&self, _notification: Notification) {}
}
