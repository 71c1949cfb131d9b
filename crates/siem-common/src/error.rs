//! Error types for OpenSIEM

use thiserror::Error;

/// OpenSIEM error type
#[derive(Error, Debug)]
pub enum SiemError {
    /// Rule failed validation or compilation
    #[error("invalid rule {rule_id}: {reason}")]
    InvalidRule {
        /// Offending rule id
        rule_id: String,
        /// Validation failure detail
        reason: String,
    },

    /// Playbook failed validation
    #[error("invalid playbook {playbook_id}: {reason}")]
    InvalidPlaybook {
        /// Offending playbook id
        playbook_id: String,
        /// Validation failure detail
        reason: String,
    },

    /// A non-terminal execution already exists for this (playbook, alert)
    #[error("execution already active for playbook {playbook_id} on alert {alert_id}")]
    DuplicateExecution {
        /// Playbook whose execution was requested
        playbook_id: String,
        /// Alert the execution was requested for
        alert_id: String,
    },

    /// No handler registered for an action kind
    #[error("no handler registered for action kind {0}")]
    UnknownActionKind(String),

    /// Illegal execution state transition
    #[error("illegal execution transition {from} -> {to}")]
    IllegalTransition {
        /// State the execution was in
        from: String,
        /// State the transition requested
        to: String,
    },

    /// Record not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind ("rule", "alert", "playbook", "execution", ...)
        kind: &'static str,
        /// Record id
        id: String,
    },

    /// Append-only store contract violated
    #[error("append-only violation on {kind} {id}: {reason}")]
    AppendOnlyViolation {
        /// Record kind
        kind: &'static str,
        /// Record id
        id: String,
        /// What was attempted
        reason: String,
    },

    /// Illegal alert/incident status transition
    #[error("illegal status transition {from} -> {to}")]
    IllegalStatusChange {
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },
}

/// Result type for OpenSIEM
pub type SiemResult<T> = Result<T, SiemError>;
