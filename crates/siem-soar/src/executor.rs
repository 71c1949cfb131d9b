//! Execution Engine
//!
//! Drives playbook executions through their state machine:
//!
//! ```text
//! pending ──► running ──► success | failed | cancelled
//!    │           │▲
//!    │           ▼│ approved
//!    └──► awaiting_approval ──► rejected
//!
//! failed/cancelled/rejected ──► rolled_back   (explicit trigger)
//! running ──► rolled_back                      (cancel with rollback)
//! ```
//!
//! One spawned task per execution; steps within an execution are
//! strictly sequential. An execution awaiting approval holds no worker,
//! only a suspended task parked on its control channel. Cancellation is
//! cooperative: the in-flight action finishes and is recorded, no
//! further actions are dispatched.

use crate::actions::{ActionContext, ActionOutcome, ActionRegistry};
use crate::audit::{ActionResult, ActionStatus, ExecutionLog};
use crate::playbook::{Playbook, PlaybookAction, PlaybookStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use siem_common::{Notification, NotificationSink, Severity, SiemError, SiemResult};
use siem_detect::Alert;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Execution lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    AwaitingApproval,
    Success,
    Failed,
    Cancelled,
    Rejected,
    RolledBack,
}

impl ExecutionStatus {
    /// Terminal statuses end the execution's task.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Rejected
                | ExecutionStatus::RolledBack
        )
    }

    /// Legal edges of the state machine.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, AwaitingApproval)
                | (Pending, Cancelled)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, AwaitingApproval)
                | (Running, RolledBack)
                | (AwaitingApproval, Running)
                | (AwaitingApproval, Rejected)
                | (AwaitingApproval, Cancelled)
                | (Failed, RolledBack)
                | (Cancelled, RolledBack)
                | (Rejected, RolledBack)
        )
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::AwaitingApproval => "awaiting_approval",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Rejected => "rejected",
            ExecutionStatus::RolledBack => "rolled_back",
        }
    }
}

/// What started an execution: exactly one of an alert, an incident, or
/// an operator.
#[derive(Debug, Clone)]
pub enum ExecutionTrigger {
    Alert(Box<Alert>),
    Incident { incident_id: String, severity: Severity },
    Manual { actor: String },
}

impl ExecutionTrigger {
    fn severity(&self) -> Option<Severity> {
        match self {
            ExecutionTrigger::Alert(alert) => Some(alert.severity),
            ExecutionTrigger::Incident { severity, .. } => Some(*severity),
            ExecutionTrigger::Manual { .. } => None,
        }
    }

    fn alert_id(&self) -> Option<&str> {
        match self {
            ExecutionTrigger::Alert(alert) => Some(&alert.id),
            _ => None,
        }
    }
}

/// Approval gate record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalState {
    pub required: bool,
    pub decided_by: Option<String>,
    pub approved: Option<bool>,
    pub comment: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// One run of a playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookExecution {
    pub id: String,
    pub playbook_id: String,
    /// Triggering alert, when alert-triggered
    pub alert_id: Option<String>,
    /// Triggering incident, when incident-triggered
    pub incident_id: Option<String>,
    /// Operator, when manually triggered
    pub triggered_by: Option<String>,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub approval: ApprovalState,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub rolled_back: bool,
    pub rollback_reason: Option<String>,
}

enum ControlSignal {
    Approval {
        approved: bool,
        approver: String,
        comment: Option<String>,
    },
    Cancel {
        rollback: bool,
        reason: String,
    },
}

/// Engine configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct SoarConfig {
    /// Depth of each execution's control channel
    pub control_queue_depth: usize,
}

impl Default for SoarConfig {
    fn default() -> Self {
        Self {
            control_queue_depth: 8,
        }
    }
}

struct ActionDispatch {
    status: ActionStatus,
    outcome: Option<ActionOutcome>,
    error: Option<String>,
}

/// The SOAR execution engine.
pub struct ExecutionEngine {
    playbooks: Arc<PlaybookStore>,
    registry: Arc<ActionRegistry>,
    log: Arc<ExecutionLog>,
    executions: DashMap<String, PlaybookExecution>,
    /// (playbook id, alert id) -> execution id; enforces at most one
    /// non-terminal execution per pair
    guard: DashMap<(String, String), String>,
    control: DashMap<String, mpsc::Sender<ControlSignal>>,
    sink: Arc<dyn NotificationSink>,
    config: SoarConfig,
}

impl ExecutionEngine {
    /// New engine over shared stores.
    pub fn new(
        playbooks: Arc<PlaybookStore>,
        registry: Arc<ActionRegistry>,
        log: Arc<ExecutionLog>,
        sink: Arc<dyn NotificationSink>,
        config: SoarConfig,
    ) -> Self {
        Self {
            playbooks,
            registry,
            log,
            executions: DashMap::new(),
            guard: DashMap::new(),
            control: DashMap::new(),
            sink,
            config,
        }
    }

    /// Start an execution of a playbook. Rejected when the playbook is
    /// unknown/disabled, a handler is missing, or a non-terminal
    /// execution already exists for the same (playbook, alert) pair.
    pub async fn start(
        self: &Arc<Self>,
        playbook_id: &str,
        trigger: ExecutionTrigger,
    ) -> SiemResult<String> {
        let playbook = self.playbooks.get(playbook_id).ok_or(SiemError::NotFound {
            kind: "playbook",
            id: playbook_id.to_string(),
        })?;
        if !playbook.enabled {
            return Err(SiemError::InvalidPlaybook {
                playbook_id: playbook_id.to_string(),
                reason: "playbook is disabled".into(),
            });
        }
        self.registry.validate_playbook(&playbook)?;

        let execution_id = uuid::Uuid::new_v4().to_string();
        let execution = PlaybookExecution {
            id: execution_id.clone(),
            playbook_id: playbook.id.clone(),
            alert_id: trigger.alert_id().map(String::from),
            incident_id: match &trigger {
                ExecutionTrigger::Incident { incident_id, .. } => Some(incident_id.clone()),
                _ => None,
            },
            triggered_by: match &trigger {
                ExecutionTrigger::Manual { actor } => Some(actor.clone()),
                _ => None,
            },
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            approval: ApprovalState::default(),
            success: None,
            error_message: None,
            rolled_back: false,
            rollback_reason: None,
        };
        self.executions.insert(execution_id.clone(), execution);

        // At most one non-terminal execution per (playbook, alert)
        // pair, checked under the guard entry's lock.
        if let Some(alert_id) = trigger.alert_id() {
            let key = (playbook.id.clone(), alert_id.to_string());
            match self.guard.entry(key) {
                dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                    let active = self
                        .executions
                        .get(existing.get())
                        .map(|e| !e.status.is_terminal())
                        .unwrap_or(false);
                    if active {
                        self.executions.remove(&execution_id);
                        return Err(SiemError::DuplicateExecution {
                            playbook_id: playbook.id.clone(),
                            alert_id: alert_id.to_string(),
                        });
                    }
                    existing.insert(execution_id.clone());
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(execution_id.clone());
                }
            }
        }

        let (tx, rx) = mpsc::channel(self.config.control_queue_depth.max(1));
        self.control.insert(execution_id.clone(), tx);

        if let Some(stats) = self.playbooks.stats(&playbook.id) {
            stats.record_execution(Utc::now());
        }
        self.notify(&execution_id, &playbook.id, ExecutionStatus::Pending).await;

        let engine = Arc::clone(self);
        let id = execution_id.clone();
        tokio::spawn(async move {
            engine.run(id, playbook, trigger, rx).await;
        });

        Ok(execution_id)
    }

    /// Deliver an operator approval decision to a suspended execution.
    pub async fn approve(
        &self,
        execution_id: &str,
        approved: bool,
        approver: &str,
        comment: Option<String>,
    ) -> SiemResult<()> {
        let status = self
            .get_execution(execution_id)
            .ok_or(SiemError::NotFound {
                kind: "execution",
                id: execution_id.to_string(),
            })?
            .status;
        if status != ExecutionStatus::AwaitingApproval {
            return Err(SiemError::IllegalTransition {
                from: status.as_str().to_string(),
                to: if approved { "running" } else { "rejected" }.to_string(),
            });
        }
        self.send_control(
            execution_id,
            ControlSignal::Approval {
                approved,
                approver: approver.to_string(),
                comment,
            },
        )
        .await
    }

    /// Request cancellation. Cooperative: the current action finishes,
    /// no further actions are dispatched.
    pub async fn cancel(&self, execution_id: &str, reason: &str) -> SiemResult<()> {
        let status = self
            .get_execution(execution_id)
            .ok_or(SiemError::NotFound {
                kind: "execution",
                id: execution_id.to_string(),
            })?
            .status;
        if status.is_terminal() {
            return Err(SiemError::IllegalTransition {
                from: status.as_str().to_string(),
                to: "cancelled".to_string(),
            });
        }
        self.send_control(
            execution_id,
            ControlSignal::Cancel {
                rollback: false,
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// Explicitly roll back an execution: compensate every succeeded
    /// action, newest first. Running executions are cancelled first;
    /// non-success terminal executions roll back in place.
    pub async fn trigger_rollback(self: &Arc<Self>, execution_id: &str, reason: &str) -> SiemResult<()> {
        let execution = self.get_execution(execution_id).ok_or(SiemError::NotFound {
            kind: "execution",
            id: execution_id.to_string(),
        })?;
        match execution.status {
            ExecutionStatus::Running | ExecutionStatus::Pending | ExecutionStatus::AwaitingApproval => {
                self.send_control(
                    execution_id,
                    ControlSignal::Cancel {
                        rollback: true,
                        reason: reason.to_string(),
                    },
                )
                .await
            }
            ExecutionStatus::Failed | ExecutionStatus::Cancelled | ExecutionStatus::Rejected
                if !execution.rolled_back =>
            {
                let engine = Arc::clone(self);
                let id = execution_id.to_string();
                let reason = reason.to_string();
                tokio::spawn(async move {
                    engine.rollback_terminal(&id, &reason).await;
                });
                Ok(())
            }
            other => Err(SiemError::IllegalTransition {
                from: other.as_str().to_string(),
                to: "rolled_back".to_string(),
            }),
        }
    }

    /// Fetch one execution record.
    pub fn get_execution(&self, execution_id: &str) -> Option<PlaybookExecution> {
        self.executions.get(execution_id).map(|e| e.clone())
    }

    /// All executions for an alert, any playbook.
    pub fn executions_for_alert(&self, alert_id: &str) -> Vec<PlaybookExecution> {
        self.executions
            .iter()
            .filter(|e| e.alert_id.as_deref() == Some(alert_id))
            .map(|e| e.clone())
            .collect()
    }

    /// Executions in a non-terminal status.
    pub fn active_count(&self) -> usize {
        self.executions
            .iter()
            .filter(|e| !e.status.is_terminal())
            .count()
    }

    /// Shared execution log.
    pub fn log(&self) -> &Arc<ExecutionLog> {
        &self.log
    }

    async fn send_control(&self, execution_id: &str, signal: ControlSignal) -> SiemResult<()> {
        let sender = self
            .control
            .get(execution_id)
            .map(|s| s.clone())
            .ok_or(SiemError::NotFound {
                kind: "execution",
                id: execution_id.to_string(),
            })?;
        sender.send(signal).await.map_err(|_| SiemError::NotFound {
            kind: "execution",
            id: execution_id.to_string(),
        })
    }

    async fn run(
        self: Arc<Self>,
        execution_id: String,
        playbook: Playbook,
        trigger: ExecutionTrigger,
        mut rx: mpsc::Receiver<ControlSignal>,
    ) {
        // Approval gate. No expiry: the execution suspends until an
        // operator decides or cancels.
        let auto_approved = trigger
            .severity()
            .map(|s| playbook.auto_approve_severities.contains(&s))
            .unwrap_or(false);
        let needs_approval = playbook.requires_approval && !auto_approved;

        if let Some(mut execution) = self.executions.get_mut(&execution_id) {
            execution.approval.required = needs_approval;
        }

        if needs_approval {
            self.set_status(&execution_id, ExecutionStatus::AwaitingApproval);
            self.notify(&execution_id, &playbook.id, ExecutionStatus::AwaitingApproval)
                .await;
            tracing::info!(execution_id = %execution_id, playbook_id = %playbook.id, "awaiting approval");

            loop {
                match rx.recv().await {
                    Some(ControlSignal::Approval {
                        approved,
                        approver,
                        comment,
                    }) => {
                        if let Some(mut execution) = self.executions.get_mut(&execution_id) {
                            execution.approval.decided_by = Some(approver);
                            execution.approval.approved = Some(approved);
                            execution.approval.comment = comment;
                            execution.approval.decided_at = Some(Utc::now());
                        }
                        if approved {
                            break;
                        }
                        self.finalize(
                            &execution_id,
                            &playbook,
                            ExecutionStatus::Rejected,
                            None,
                            Some("approval rejected".into()),
                            false,
                            None,
                        )
                        .await;
                        return;
                    }
                    Some(ControlSignal::Cancel { reason, .. }) => {
                        self.finalize(
                            &execution_id,
                            &playbook,
                            ExecutionStatus::Cancelled,
                            None,
                            Some(reason),
                            false,
                            None,
                        )
                        .await;
                        return;
                    }
                    None => {
                        self.finalize(
                            &execution_id,
                            &playbook,
                            ExecutionStatus::Cancelled,
                            None,
                            Some("control channel closed".into()),
                            false,
                            None,
                        )
                        .await;
                        return;
                    }
                }
            }
        }

        self.set_status(&execution_id, ExecutionStatus::Running);
        self.notify(&execution_id, &playbook.id, ExecutionStatus::Running).await;

        let mut ctx = ActionContext {
            execution_id: execution_id.clone(),
            playbook_id: playbook.id.clone(),
            alert: match &trigger {
                ExecutionTrigger::Alert(alert) => Some((**alert).clone()),
                _ => None,
            },
            incident_id: match &trigger {
                ExecutionTrigger::Incident { incident_id, .. } => Some(incident_id.clone()),
                _ => None,
            },
            variables: HashMap::new(),
        };

        let mut succeeded: Vec<PlaybookAction> = Vec::new();
        let mut cancel: Option<(bool, String)> = None;

        for action in &playbook.actions {
            // Pick up control signals between actions.
            while let Ok(signal) = rx.try_recv() {
                match signal {
                    ControlSignal::Cancel { rollback, reason } => cancel = Some((rollback, reason)),
                    ControlSignal::Approval { .. } => {
                        tracing::debug!(execution_id = %execution_id, "approval signal ignored while running");
                    }
                }
            }
            if let Some((rollback, reason)) = cancel.take() {
                if rollback {
                    self.run_rollbacks(&execution_id, &succeeded, &mut ctx).await;
                    self.finalize(
                        &execution_id,
                        &playbook,
                        ExecutionStatus::RolledBack,
                        Some(false),
                        None,
                        true,
                        Some(reason),
                    )
                    .await;
                } else {
                    self.finalize(
                        &execution_id,
                        &playbook,
                        ExecutionStatus::Cancelled,
                        None,
                        Some(reason),
                        false,
                        None,
                    )
                    .await;
                }
                return;
            }

            let dispatch = self.run_action(&execution_id, action, &ctx, false).await;
            match dispatch.status {
                ActionStatus::Success => {
                    if let Some(outcome) = dispatch.outcome {
                        ctx.variables.extend(outcome.output);
                    }
                    succeeded.push(action.clone());
                }
                _ => {
                    if action.continue_on_failure {
                        tracing::warn!(
                            execution_id = %execution_id,
                            action_id = %action.id,
                            "action failed, continuing per configuration"
                        );
                        continue;
                    }
                    let rolled_back = self.run_rollbacks(&execution_id, &succeeded, &mut ctx).await;
                    self.finalize(
                        &execution_id,
                        &playbook,
                        ExecutionStatus::Failed,
                        Some(false),
                        dispatch.error.or_else(|| Some("action failed".into())),
                        rolled_back,
                        rolled_back.then(|| format!("action {} failed", action.id)),
                    )
                    .await;
                    return;
                }
            }
        }

        self.finalize(
            &execution_id,
            &playbook,
            ExecutionStatus::Success,
            Some(true),
            None,
            false,
            None,
        )
        .await;
    }

    /// Execute one action with its timeout and retry budget, logging
    /// every attempt.
    async fn run_action(
        &self,
        execution_id: &str,
        action: &PlaybookAction,
        ctx: &ActionContext,
        is_rollback: bool,
    ) -> ActionDispatch {
        let handler = match self.registry.handler(action.kind) {
            Ok(handler) => handler,
            Err(e) => {
                // Validated at start; only reachable if the registry
                // changed underneath a running execution.
                return ActionDispatch {
                    status: ActionStatus::Failed,
                    outcome: None,
                    error: Some(e.to_string()),
                };
            }
        };

        let deadline = std::time::Duration::from_secs(action.timeout_seconds);
        let mut last_error = None;

        for attempt in 0..=action.retry_count {
            let seq = self.log.next_seq(execution_id);
            let started_at = Utc::now();
            let begun = std::time::Instant::now();

            let result = tokio::time::timeout(deadline, handler.execute(&action.config, ctx)).await;
            let duration_ms = begun.elapsed().as_millis() as u64;

            let (status, payload, output, error, retryable) = match result {
                // Timeout cancels the in-flight call and counts as a
                // failed attempt.
                Err(_) => (
                    ActionStatus::Timeout,
                    serde_json::Value::Null,
                    HashMap::new(),
                    Some(format!("timed out after {}s", action.timeout_seconds)),
                    true,
                ),
                Ok(Err(e)) => {
                    let retryable = e.is_retryable();
                    (
                        ActionStatus::Failed,
                        serde_json::Value::Null,
                        HashMap::new(),
                        Some(e.to_string()),
                        retryable,
                    )
                }
                Ok(Ok(outcome)) => (
                    ActionStatus::Success,
                    outcome.payload.clone(),
                    outcome.output.clone(),
                    None,
                    false,
                ),
            };

            let record = ActionResult {
                id: uuid::Uuid::new_v4().to_string(),
                execution_id: execution_id.to_string(),
                seq,
                action_id: action.id.clone(),
                action_name: action.name.clone(),
                kind: action.kind,
                status,
                attempt,
                started_at,
                finished_at: Some(Utc::now()),
                duration_ms: Some(duration_ms),
                payload: payload.clone(),
                error: error.clone(),
                output: output.clone(),
                rollback: is_rollback,
            };
            if let Err(e) = self.log.append(record) {
                tracing::error!(execution_id = %execution_id, error = %e, "execution log append failed");
            }

            match status {
                ActionStatus::Success => {
                    return ActionDispatch {
                        status,
                        outcome: Some(ActionOutcome { payload, output }),
                        error: None,
                    };
                }
                _ => {
                    tracing::warn!(
                        execution_id = %execution_id,
                        action_id = %action.id,
                        attempt,
                        status = status.as_str(),
                        error = error.as_deref().unwrap_or("-"),
                        "action attempt failed"
                    );
                    last_error = error;
                    if !retryable {
                        return ActionDispatch {
                            status,
                            outcome: None,
                            error: last_error,
                        };
                    }
                    if attempt < action.retry_count {
                        tokio::time::sleep(std::time::Duration::from_secs(
                            action.retry_delay_seconds,
                        ))
                        .await;
                        continue;
                    }
                    return ActionDispatch {
                        status,
                        outcome: None,
                        error: last_error,
                    };
                }
            }
        }

        // retry_count is bounded, the loop always returns.
        ActionDispatch {
            status: ActionStatus::Failed,
            outcome: None,
            error: last_error,
        }
    }

    /// Invoke the rollback actions of succeeded actions, newest first.
    /// Returns true when at least one rollback was invoked.
    async fn run_rollbacks(
        &self,
        execution_id: &str,
        succeeded: &[PlaybookAction],
        ctx: &mut ActionContext,
    ) -> bool {
        let mut invoked = false;
        for action in succeeded.iter().rev() {
            let Some(rollback) = &action.rollback else {
                continue;
            };
            invoked = true;
            tracing::info!(
                execution_id = %execution_id,
                action_id = %action.id,
                rollback_id = %rollback.id,
                "invoking rollback"
            );
            let dispatch = self.run_action(execution_id, rollback, ctx, true).await;
            if let Some(outcome) = dispatch.outcome {
                ctx.variables.extend(outcome.output);
            } else {
                // Rollback failures are recorded but do not stop the
                // remaining compensations.
                tracing::error!(
                    execution_id = %execution_id,
                    rollback_id = %rollback.id,
                    error = dispatch.error.as_deref().unwrap_or("-"),
                    "rollback action failed"
                );
            }
        }
        invoked
    }

    /// Roll back a non-success terminal execution using the execution
    /// log as the record of what succeeded.
    async fn rollback_terminal(self: Arc<Self>, execution_id: &str, reason: &str) {
        let Some(execution) = self.get_execution(execution_id) else {
            return;
        };
        let Some(playbook) = self.playbooks.get(&execution.playbook_id) else {
            return;
        };

        let succeeded_ids: Vec<String> = self
            .log
            .succeeded(execution_id)
            .into_iter()
            .map(|r| r.action_id)
            .collect();
        let mut ctx = ActionContext {
            execution_id: execution_id.to_string(),
            playbook_id: playbook.id.clone(),
            alert: None,
            incident_id: execution.incident_id.clone(),
            variables: self
                .log
                .succeeded(execution_id)
                .into_iter()
                .flat_map(|r| r.output)
                .collect(),
        };
        let succeeded: Vec<PlaybookAction> = playbook
            .actions
            .iter()
            .filter(|a| succeeded_ids.iter().any(|id| id == &a.id))
            .cloned()
            .collect();

        self.run_rollbacks(execution_id, &succeeded, &mut ctx).await;

        if let Some(mut execution) = self.executions.get_mut(execution_id) {
            if execution.status.can_transition_to(ExecutionStatus::RolledBack) {
                execution.status = ExecutionStatus::RolledBack;
                execution.rolled_back = true;
                execution.rollback_reason = Some(reason.to_string());
            }
        }
        self.notify(execution_id, &playbook.id, ExecutionStatus::RolledBack)
            .await;
    }

    fn set_status(&self, execution_id: &str, next: ExecutionStatus) {
        let Some(mut execution) = self.executions.get_mut(execution_id) else {
            return;
        };
        if !execution.status.can_transition_to(next) {
            tracing::error!(
                execution_id = %execution_id,
                from = execution.status.as_str(),
                to = next.as_str(),
                "illegal transition suppressed"
            );
            return;
        }
        execution.status = next;
        if next == ExecutionStatus::Running && execution.started_at.is_none() {
            execution.started_at = Some(Utc::now());
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        execution_id: &str,
        playbook: &Playbook,
        status: ExecutionStatus,
        success: Option<bool>,
        error_message: Option<String>,
        rolled_back: bool,
        rollback_reason: Option<String>,
    ) {
        {
            let Some(mut execution) = self.executions.get_mut(execution_id) else {
                return;
            };
            if !execution.status.can_transition_to(status) {
                tracing::error!(
                    execution_id = %execution_id,
                    from = execution.status.as_str(),
                    to = status.as_str(),
                    "illegal terminal transition suppressed"
                );
                return;
            }
            execution.status = status;
            execution.completed_at = Some(Utc::now());
            execution.duration_ms = execution
                .started_at
                .or(Some(execution.created_at))
                .map(|t| (Utc::now() - t).num_milliseconds().max(0) as u64);
            execution.success = success;
            execution.error_message = error_message;
            execution.rolled_back = rolled_back;
            execution.rollback_reason = rollback_reason;
        }

        match status {
            ExecutionStatus::Success => {
                if let Some(stats) = self.playbooks.stats(&playbook.id) {
                    stats.record_outcome(true);
                }
            }
            ExecutionStatus::Failed | ExecutionStatus::RolledBack => {
                if let Some(stats) = self.playbooks.stats(&playbook.id) {
                    stats.record_outcome(false);
                }
            }
            _ => {}
        }

        self.control.remove(execution_id);
        tracing::info!(
            execution_id = %execution_id,
            playbook_id = %playbook.id,
            status = status.as_str(),
            "execution finished"
        );
        self.notify(execution_id, &playbook.id, status).await;
    }

    async fn notify(&self, execution_id: &str, playbook_id: &str, status: ExecutionStatus) {
        self.sink
            .publish(Notification::ExecutionStatusChanged {
                execution_id: execution_id.to_string(),
                playbook_id: playbook_id.to_string(),
                status: status.as_str().to_string(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionError, ActionHandler};
    use crate::playbook::ActionKind;
    use serde_json::json;
    use siem_common::NullSink;
    use siem_detect::AlertStatus;

    enum Behavior {
        Succeed,
        SucceedWith(Vec<(&'static str, serde_json::Value)>),
        FailFatal,
        Hang,
        SleepThenSucceed(u64),
    }

    struct ScriptedHandler {
        kind: ActionKind,
        behavior: Behavior,
    }

    #[async_trait::async_trait]
    impl ActionHandler for ScriptedHandler {
        fn kind(&self) -> ActionKind {
            self.kind
        }

        async fn execute(
            &self,
            _config: &HashMap<String, String>,
            _ctx: &ActionContext,
        ) -> Result<ActionOutcome, ActionError> {
            match &self.behavior {
                Behavior::Succeed => Ok(ActionOutcome::default()),
                Behavior::SucceedWith(vars) => Ok(ActionOutcome {
                    payload: serde_json::Value::Null,
                    output: vars
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.clone()))
                        .collect(),
                }),
                Behavior::FailFatal => Err(ActionError::Rejected("integration refused".into())),
                Behavior::Hang => {
                    tokio::time::sleep(std::time::Duration::from_secs(86_400)).await;
                    Ok(ActionOutcome::default())
                }
                Behavior::SleepThenSucceed(secs) => {
                    tokio::time::sleep(std::time::Duration::from_secs(*secs)).await;
                    Ok(ActionOutcome::default())
                }
            }
        }
    }

    fn test_alert(id: &str, severity: Severity) -> Alert {
        let now = Utc::now();
        Alert {
            id: id.into(),
            external_ref: format!("ALT-{}", id),
            rule_id: "rule-1".into(),
            rule_name: "Brute Force Logon".into(),
            severity,
            title: "Brute Force Logon".into(),
            description: String::new(),
            category: "authentication".into(),
            event_ids: vec!["e1".into()],
            event_count: 1,
            first_event_time: now,
            last_event_time: now,
            host: Some("ws-042".into()),
            subject_user: Some("jdoe".into()),
            source_ip: Some("10.0.0.7".into()),
            process_name: None,
            mitre_tactic: Some("TA0006".into()),
            mitre_technique: Some("T1110".into()),
            status: AlertStatus::New,
            incident_id: None,
            analysis: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn action(id: &str, kind: ActionKind) -> PlaybookAction {
        PlaybookAction {
            id: id.into(),
            name: id.into(),
            kind,
            config: HashMap::new(),
            timeout_seconds: 5,
            retry_count: 0,
            retry_delay_seconds: 0,
            continue_on_failure: false,
            rollback: None,
        }
    }

    fn playbook(id: &str, actions: Vec<PlaybookAction>) -> Playbook {
        Playbook {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            enabled: true,
            trigger: Default::default(),
            actions,
            requires_approval: false,
            auto_approve_severities: vec![],
            created_at: Utc::now(),
        }
    }

    fn engine_with(
        handlers: Vec<ScriptedHandler>,
        playbooks: Vec<Playbook>,
    ) -> Arc<ExecutionEngine> {
        let registry = ActionRegistry::new();
        for handler in handlers {
            registry.register(Arc::new(handler));
        }
        let store = PlaybookStore::new();
        assert!(store.load(playbooks).is_empty());
        Arc::new(ExecutionEngine::new(
            Arc::new(store),
            Arc::new(registry),
            Arc::new(ExecutionLog::new()),
            Arc::new(NullSink),
            SoarConfig::default(),
        ))
    }

    async fn wait_for_status(
        engine: &Arc<ExecutionEngine>,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> PlaybookExecution {
        for _ in 0..20_000 {
            let execution = engine.get_execution(execution_id).expect("execution exists");
            if execution.status == status {
                return execution;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for status {:?}", status.as_str());
    }

    async fn wait_terminal(engine: &Arc<ExecutionEngine>, execution_id: &str) -> PlaybookExecution {
        for _ in 0..20_000 {
            let execution = engine.get_execution(execution_id).expect("execution exists");
            if execution.status.is_terminal() {
                return execution;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for terminal status");
    }

    #[test]
    fn state_machine_edges() {
        use ExecutionStatus::*;
        // The happy path and the approval path.
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(AwaitingApproval));
        assert!(Running.can_transition_to(Success));
        assert!(AwaitingApproval.can_transition_to(Running));
        assert!(AwaitingApproval.can_transition_to(Rejected));
        // Rollback reachability.
        assert!(Running.can_transition_to(RolledBack));
        assert!(Failed.can_transition_to(RolledBack));
        assert!(!Success.can_transition_to(RolledBack));
        // Terminals are terminal.
        for terminal in [Success, Failed, Cancelled, Rejected, RolledBack] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Running));
        }
        // No resurrection or skipping.
        assert!(!Success.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Success));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_execution_is_sequential_and_counted() {
        let engine = engine_with(
            vec![
                ScriptedHandler {
                    kind: ActionKind::BlockIp,
                    behavior: Behavior::Succeed,
                },
                ScriptedHandler {
                    kind: ActionKind::IsolateHost,
                    behavior: Behavior::Succeed,
                },
            ],
            vec![playbook(
                "pb",
                vec![
                    action("a1", ActionKind::BlockIp),
                    action("a2", ActionKind::IsolateHost),
                ],
            )],
        );

        let id = engine
            .start(
                "pb",
                ExecutionTrigger::Manual {
                    actor: "analyst".into(),
                },
            )
            .await
            .unwrap();
        let execution = wait_terminal(&engine, &id).await;

        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.success, Some(true));
        assert!(execution.started_at.is_some());
        assert!(execution.completed_at.is_some());

        let log = engine.log().for_execution(&id);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].action_id, "a1");
        assert_eq!(log[1].action_id, "a2");
        assert!(log.windows(2).all(|w| w[0].seq < w[1].seq));

        let stats = engine.playbooks.stats("pb").unwrap().snapshot();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 0);
        assert!(stats.last_executed.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn approval_gate_suspends_and_auto_approve_bypasses() {
        let mut pb = playbook("pb", vec![action("a1", ActionKind::BlockIp)]);
        pb.requires_approval = true;
        pb.auto_approve_severities = vec![Severity::Critical];
        let engine = engine_with(
            vec![ScriptedHandler {
                kind: ActionKind::BlockIp,
                behavior: Behavior::Succeed,
            }],
            vec![pb],
        );

        // Severity 3 (High): gate engages.
        let gated = engine
            .start(
                "pb",
                ExecutionTrigger::Alert(Box::new(test_alert("a-high", Severity::High))),
            )
            .await
            .unwrap();
        let execution = wait_for_status(&engine, &gated, ExecutionStatus::AwaitingApproval).await;
        assert!(execution.approval.required);
        assert!(engine.log().for_execution(&gated).is_empty());

        engine
            .approve(&gated, true, "analyst", Some("looks real".into()))
            .await
            .unwrap();
        let execution = wait_terminal(&engine, &gated).await;
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.approval.approved, Some(true));
        assert_eq!(execution.approval.decided_by.as_deref(), Some("analyst"));

        // Severity 4 (Critical): gate bypassed, runs immediately.
        let bypassed = engine
            .start(
                "pb",
                ExecutionTrigger::Alert(Box::new(test_alert("a-crit", Severity::Critical))),
            )
            .await
            .unwrap();
        let execution = wait_terminal(&engine, &bypassed).await;
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert!(!execution.approval.required);
        assert!(execution.approval.decided_by.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_approval_is_terminal_and_frees_the_guard() {
        let mut pb = playbook("pb", vec![action("a1", ActionKind::BlockIp)]);
        pb.requires_approval = true;
        let engine = engine_with(
            vec![ScriptedHandler {
                kind: ActionKind::BlockIp,
                behavior: Behavior::Succeed,
            }],
            vec![pb],
        );

        let alert = test_alert("a1", Severity::High);
        let first = engine
            .start("pb", ExecutionTrigger::Alert(Box::new(alert.clone())))
            .await
            .unwrap();
        wait_for_status(&engine, &first, ExecutionStatus::AwaitingApproval).await;

        // The uniqueness invariant holds while non-terminal.
        let duplicate = engine
            .start("pb", ExecutionTrigger::Alert(Box::new(alert.clone())))
            .await;
        assert!(matches!(duplicate, Err(SiemError::DuplicateExecution { .. })));

        engine
            .approve(&first, false, "analyst", Some("not warranted".into()))
            .await
            .unwrap();
        let execution = wait_terminal(&engine, &first).await;
        assert_eq!(execution.status, ExecutionStatus::Rejected);
        assert!(engine.log().for_execution(&first).is_empty());

        // Approving a terminal execution is rejected.
        assert!(engine.approve(&first, true, "analyst", None).await.is_err());

        // Rejection requires a fresh manual trigger; a new start for the
        // same pair is now allowed.
        assert!(engine
            .start("pb", ExecutionTrigger::Alert(Box::new(alert)))
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_consumes_retry_budget_and_fails() {
        let engine = engine_with(
            vec![ScriptedHandler {
                kind: ActionKind::BlockIp,
                behavior: Behavior::Hang,
            }],
            vec![playbook("pb", {
                let mut a = action("a1", ActionKind::BlockIp);
                a.timeout_seconds = 5;
                a.retry_count = 2;
                a.retry_delay_seconds = 1;
                vec![a]
            })],
        );

        let id = engine
            .start(
                "pb",
                ExecutionTrigger::Manual {
                    actor: "analyst".into(),
                },
            )
            .await
            .unwrap();
        let execution = wait_terminal(&engine, &id).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.success, Some(false));
        assert!(execution.error_message.as_deref().unwrap_or("").contains("timed out"));

        // Initial attempt + 2 retries, each logged as a timeout.
        let log = engine.log().for_execution(&id);
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|r| r.status == ActionStatus::Timeout));
        assert_eq!(log.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![0, 1, 2]);

        let stats = engine.playbooks.stats("pb").unwrap().snapshot();
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_short_circuit_retries() {
        let engine = engine_with(
            vec![ScriptedHandler {
                kind: ActionKind::BlockIp,
                behavior: Behavior::FailFatal,
            }],
            vec![playbook("pb", {
                let mut a = action("a1", ActionKind::BlockIp);
                a.retry_count = 5;
                vec![a]
            })],
        );

        let id = engine
            .start(
                "pb",
                ExecutionTrigger::Manual {
                    actor: "analyst".into(),
                },
            )
            .await
            .unwrap();
        let execution = wait_terminal(&engine, &id).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(engine.log().for_execution(&id).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_rolls_back_succeeded_actions_in_reverse() {
        let mut a1 = action("a1", ActionKind::BlockIp);
        a1.rollback = Some(Box::new(action("rb1", ActionKind::SendEmail)));
        let mut a2 = action("a2", ActionKind::IsolateHost);
        a2.rollback = Some(Box::new(action("rb2", ActionKind::SlackNotification)));
        let a3 = action("a3", ActionKind::KillProcess);
        let a4 = action("a4", ActionKind::QuarantineFile);
        let a5 = action("a5", ActionKind::DisableUserAccount);

        let engine = engine_with(
            vec![
                ScriptedHandler {
                    kind: ActionKind::BlockIp,
                    behavior: Behavior::Succeed,
                },
                ScriptedHandler {
                    kind: ActionKind::IsolateHost,
                    behavior: Behavior::Succeed,
                },
                ScriptedHandler {
                    kind: ActionKind::KillProcess,
                    behavior: Behavior::FailFatal,
                },
                ScriptedHandler {
                    kind: ActionKind::QuarantineFile,
                    behavior: Behavior::Succeed,
                },
                ScriptedHandler {
                    kind: ActionKind::DisableUserAccount,
                    behavior: Behavior::Succeed,
                },
                ScriptedHandler {
                    kind: ActionKind::SendEmail,
                    behavior: Behavior::Succeed,
                },
                ScriptedHandler {
                    kind: ActionKind::SlackNotification,
                    behavior: Behavior::Succeed,
                },
            ],
            vec![playbook("pb", vec![a1, a2, a3, a4, a5])],
        );

        let id = engine
            .start(
                "pb",
                ExecutionTrigger::Manual {
                    actor: "analyst".into(),
                },
            )
            .await
            .unwrap();
        let execution = wait_terminal(&engine, &id).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.rolled_back);

        let log = engine.log().for_execution(&id);
        let ids: Vec<&str> = log.iter().map(|r| r.action_id.as_str()).collect();
        // a1, a2 succeed; a3 fails; rollbacks run newest-first; a4/a5
        // are never dispatched.
        assert_eq!(ids, vec!["a1", "a2", "a3", "rb2", "rb1"]);
        assert!(log[3].rollback && log[4].rollback);
        assert_eq!(log[3].status, ActionStatus::Success);
        assert_eq!(log[4].status, ActionStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn continue_on_failure_records_and_proceeds() {
        let mut a1 = action("a1", ActionKind::BlockIp);
        a1.continue_on_failure = true;
        let a2 = action("a2", ActionKind::IsolateHost);

        let engine = engine_with(
            vec![
                ScriptedHandler {
                    kind: ActionKind::BlockIp,
                    behavior: Behavior::FailFatal,
                },
                ScriptedHandler {
                    kind: ActionKind::IsolateHost,
                    behavior: Behavior::Succeed,
                },
            ],
            vec![playbook("pb", vec![a1, a2])],
        );

        let id = engine
            .start(
                "pb",
                ExecutionTrigger::Manual {
                    actor: "analyst".into(),
                },
            )
            .await
            .unwrap();
        let execution = wait_terminal(&engine, &id).await;

        assert_eq!(execution.status, ExecutionStatus::Success);
        let log = engine.log().for_execution(&id);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].status, ActionStatus::Failed);
        assert_eq!(log[1].status, ActionStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_cooperative() {
        let a1 = {
            let mut a = action("a1", ActionKind::BlockIp);
            a.timeout_seconds = 60;
            a
        };
        let a2 = action("a2", ActionKind::IsolateHost);
        let engine = engine_with(
            vec![
                ScriptedHandler {
                    kind: ActionKind::BlockIp,
                    behavior: Behavior::SleepThenSucceed(30),
                },
                ScriptedHandler {
                    kind: ActionKind::IsolateHost,
                    behavior: Behavior::Succeed,
                },
            ],
            vec![playbook("pb", vec![a1, a2])],
        );

        let id = engine
            .start(
                "pb",
                ExecutionTrigger::Manual {
                    actor: "analyst".into(),
                },
            )
            .await
            .unwrap();
        wait_for_status(&engine, &id, ExecutionStatus::Running).await;
        engine.cancel(&id, "operator cancelled").await.unwrap();

        let execution = wait_terminal(&engine, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Cancelled);

        // The in-flight action finished and was recorded; the next one
        // was never dispatched.
        let log = engine.log().for_execution(&id);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action_id, "a1");
        assert_eq!(log[0].status, ActionStatus::Success);

        // Cancelling a terminal execution is rejected.
        assert!(engine.cancel(&id, "again").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_rollback_of_failed_execution() {
        let engine = engine_with(
            vec![
                ScriptedHandler {
                    kind: ActionKind::BlockIp,
                    behavior: Behavior::Succeed,
                },
                ScriptedHandler {
                    kind: ActionKind::IsolateHost,
                    behavior: Behavior::FailFatal,
                },
            ],
            vec![
                playbook("pb-plain", vec![action("a1", ActionKind::BlockIp), action("a2", ActionKind::IsolateHost)]),
                playbook("pb-ok", vec![action("a1", ActionKind::BlockIp)]),
            ],
        );

        // Failed without any rollback obligations: rolled_back is false.
        let failed = engine
            .start(
                "pb-plain",
                ExecutionTrigger::Manual {
                    actor: "analyst".into(),
                },
            )
            .await
            .unwrap();
        let execution = wait_terminal(&engine, &failed).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(!execution.rolled_back);

        // Operator triggers the rollback afterwards.
        engine.trigger_rollback(&failed, "undo containment").await.unwrap();
        let execution = wait_for_status(&engine, &failed, ExecutionStatus::RolledBack).await;
        assert!(execution.rolled_back);
        assert_eq!(execution.rollback_reason.as_deref(), Some("undo containment"));

        // A successful execution cannot be rolled back.
        let ok = engine
            .start(
                "pb-ok",
                ExecutionTrigger::Manual {
                    actor: "analyst".into(),
                },
            )
            .await
            .unwrap();
        wait_terminal(&engine, &ok).await;
        assert!(engine.trigger_rollback(&ok, "nope").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn output_variables_flow_to_later_actions() {
        let engine = engine_with(
            vec![ScriptedHandler {
                kind: ActionKind::CheckThreatIntelligence,
                behavior: Behavior::SucceedWith(vec![("source_ip", json!("203.0.113.9"))]),
            }],
            vec![playbook(
                "pb",
                vec![
                    action("lookup", ActionKind::CheckThreatIntelligence),
                    action("block", ActionKind::BlockIp),
                ],
            )],
        );
        // The real handler for block_ip resolves the ip from context.
        engine.registry.register(Arc::new(crate::actions::BlockIpHandler));

        let id = engine
            .start(
                "pb",
                ExecutionTrigger::Manual {
                    actor: "analyst".into(),
                },
            )
            .await
            .unwrap();
        let execution = wait_terminal(&engine, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Success);

        let log = engine.log().for_execution(&id);
        assert_eq!(log[1].action_id, "block");
        assert_eq!(log[1].payload["ip"], json!("203.0.113.9"));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_playbook_and_missing_handler_are_start_errors() {
        let mut disabled = playbook("pb-off", vec![action("a1", ActionKind::BlockIp)]);
        disabled.enabled = false;
        let engine = engine_with(
            vec![ScriptedHandler {
                kind: ActionKind::BlockIp,
                behavior: Behavior::Succeed,
            }],
            vec![
                disabled,
                playbook("pb-unhandled", vec![action("a1", ActionKind::QuarantineFile)]),
            ],
        );

        let manual = ExecutionTrigger::Manual {
            actor: "analyst".into(),
        };
        assert!(matches!(
            engine.start("pb-off", manual.clone()).await,
            Err(SiemError::InvalidPlaybook { .. })
        ));
        assert!(matches!(
            engine
                .start(
                    "pb-unhandled",
                    ExecutionTrigger::Manual {
                        actor: "analyst".into()
                    }
                )
                .await,
            Err(SiemError::UnknownActionKind(_))
        ));
        assert!(matches!(
            engine
                .start(
                    "missing",
                    ExecutionTrigger::Manual {
                        actor: "analyst".into()
                    }
                )
                .await,
            Err(SiemError::NotFound { .. })
        ));
    }
}
