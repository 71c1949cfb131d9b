//! Action Executor
//!
//! Registry of response-action handlers. Each handler implements one
//! `ActionKind` behind the `execute(config, context) -> outcome | error`
//! contract; the engine enforces deadlines and retries around it, the
//! handler only does the side effect. Handlers are resolved when a
//! playbook is validated, so an unregistered kind never surfaces
//! mid-execution.

use crate::playbook::{alert_context, ActionKind, Playbook, PlaybookAction};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use siem_common::{SiemError, SiemResult};
use siem_detect::Alert;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Handler failure. Retryable variants consume the action's retry
/// budget; fatal variants short-circuit it.
#[derive(Debug, Error)]
pub enum ActionError {
    /// Required parameter missing from config and context (fatal)
    #[error("missing parameter: {0}")]
    MissingParam(String),
    /// The integration permanently refused the operation (fatal)
    #[error("rejected: {0}")]
    Rejected(String),
    /// Transient integration failure (retryable)
    #[error("transient failure: {0}")]
    Transient(String),
    /// Handler-observed timeout (retryable)
    #[error("timed out")]
    Timeout,
}

impl ActionError {
    /// Whether retrying can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActionError::Transient(_) | ActionError::Timeout)
    }
}

/// Successful handler result.
#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    /// Structured result recorded in the execution log
    pub payload: Value,
    /// Variables exported to subsequent actions
    pub output: HashMap<String, Value>,
}

/// Execution-scoped context visible to handlers.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub execution_id: String,
    pub playbook_id: String,
    /// Triggering alert snapshot, when alert-triggered
    pub alert: Option<Alert>,
    /// Triggering incident, when incident-triggered
    pub incident_id: Option<String>,
    /// Output variables accumulated from earlier actions
    pub variables: HashMap<String, Value>,
}

impl ActionContext {
    /// Resolve a parameter: explicit config first, then variables from
    /// earlier actions, then the alert context.
    pub fn resolve(&self, config: &HashMap<String, String>, key: &str) -> Option<String> {
        if let Some(v) = config.get(key) {
            return Some(v.clone());
        }
        if let Some(v) = self.variables.get(key) {
            return Some(match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
        self.alert
            .as_ref()
            .and_then(|alert| alert_context(alert).get(key).cloned())
    }

    fn require(&self, config: &HashMap<String, String>, key: &str) -> Result<String, ActionError> {
        self.resolve(config, key)
            .ok_or_else(|| ActionError::MissingParam(key.to_string()))
    }
}

/// One response-action implementation.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// The kind this handler serves.
    fn kind(&self) -> ActionKind;
    /// Perform the side effect. The engine owns the deadline; a handler
    /// past it is cancelled, not trusted to stop itself.
    async fn execute(
        &self,
        config: &HashMap<String, String>,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome, ActionError>;
}

/// Compile-time-checked dispatch table from action kind to handler.
pub struct ActionRegistry {
    handlers: DashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Registry with every built-in handler installed.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(BlockIpHandler));
        registry.register(Arc::new(IsolateHostHandler));
        registry.register(Arc::new(KillProcessHandler));
        registry.register(Arc::new(QuarantineFileHandler));
        registry.register(Arc::new(DisableUserAccountHandler));
        registry.register(Arc::new(CheckThreatIntelHandler));
        registry.register(Arc::new(SendEmailHandler));
        registry.register(Arc::new(SlackNotificationHandler::default()));
        registry.register(Arc::new(CreateTicketHandler::default()));
        registry
    }

    /// Install a handler, replacing any previous one for the kind.
    pub fn register(&self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// Resolve the handler for a kind.
    pub fn handler(&self, kind: ActionKind) -> SiemResult<Arc<dyn ActionHandler>> {
        self.handlers
            .get(&kind)
            .map(|h| h.clone())
            .ok_or_else(|| SiemError::UnknownActionKind(kind.as_str().to_string()))
    }

    /// Check that every action (and rollback action) in a playbook has a
    /// handler. Called at load/start time.
    pub fn validate_playbook(&self, playbook: &Playbook) -> SiemResult<()> {
        fn walk<'a>(actions: &'a [PlaybookAction], out: &mut Vec<&'a PlaybookAction>) {
            for action in actions {
                out.push(action);
                if let Some(rollback) = &action.rollback {
                    out.push(rollback);
                }
            }
        }
        let mut all = Vec::new();
        walk(&playbook.actions, &mut all);
        for action in all {
            self.handler(action.kind)?;
        }
        Ok(())
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// Containment handlers drive the enforcement plane through the agent
// control channel; here they record the order and export its key facts.

pub struct BlockIpHandler;

#[async_trait]
impl ActionHandler for BlockIpHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::BlockIp
    }

    async fn execute(
        &self,
        config: &HashMap<String, String>,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome, ActionError> {
        // Fallback to a previous block's exported variable so a
        // compensating "unblock" can run from the execution log alone.
        let ip = ctx
            .require(config, "source_ip")
            .or_else(|_| ctx.require(config, "ip"))
            .or_else(|_| ctx.require(config, "blocked_ip"))?;
        let operation = config.get("operation").map(String::as_str).unwrap_or("block");
        let duration_secs = config
            .get("duration_secs")
            .and_then(|d| d.parse::<u64>().ok())
            .unwrap_or(3600);
        tracing::info!(%ip, operation, duration_secs, "firewall order issued");
        Ok(ActionOutcome {
            payload: json!({
                "action": "block_ip",
                "ip": ip,
                "operation": operation,
                "duration_secs": duration_secs,
            }),
            output: HashMap::from([("blocked_ip".to_string(), json!(ip))]),
        })
    }
}

pub struct IsolateHostHandler;

#[async_trait]
impl ActionHandler for IsolateHostHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::IsolateHost
    }

    async fn execute(
        &self,
        config: &HashMap<String, String>,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome, ActionError> {
        let host = ctx
            .require(config, "host")
            .or_else(|_| ctx.require(config, "isolated_host"))?;
        let operation = config.get("operation").map(String::as_str).unwrap_or("isolate");
        tracing::info!(%host, operation, "host isolation order issued");
        Ok(ActionOutcome {
            payload: json!({"action": "isolate_host", "host": host, "operation": operation}),
            output: HashMap::from([("isolated_host".to_string(), json!(host))]),
        })
    }
}

pub struct KillProcessHandler;

#[async_trait]
impl ActionHandler for KillProcessHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::KillProcess
    }

    async fn execute(
        &self,
        config: &HashMap<String, String>,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome, ActionError> {
        let process = ctx.require(config, "process_name")?;
        let host = ctx.resolve(config, "host");
        tracing::info!(%process, host = host.as_deref().unwrap_or("-"), "process kill order issued");
        Ok(ActionOutcome {
            payload: json!({"action": "kill_process", "process": process, "host": host}),
            output: HashMap::new(),
        })
    }
}

pub struct QuarantineFileHandler;

#[async_trait]
impl ActionHandler for QuarantineFileHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::QuarantineFile
    }

    async fn execute(
        &self,
        config: &HashMap<String, String>,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome, ActionError> {
        let path = ctx.require(config, "file_path")?;
        let host = ctx.resolve(config, "host");
        tracing::info!(%path, host = host.as_deref().unwrap_or("-"), "file quarantine order issued");
        Ok(ActionOutcome {
            payload: json!({"action": "quarantine_file", "path": path, "host": host}),
            output: HashMap::from([("quarantined_file".to_string(), json!(path))]),
        })
    }
}

pub struct DisableUserAccountHandler;

#[async_trait]
impl ActionHandler for DisableUserAccountHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::DisableUserAccount
    }

    async fn execute(
        &self,
        config: &HashMap<String, String>,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome, ActionError> {
        let user = ctx.require(config, "subject_user").or_else(|_| ctx.require(config, "user"))?;
        tracing::info!(%user, "account disable order issued");
        Ok(ActionOutcome {
            payload: json!({"action": "disable_user_account", "user": user}),
            output: HashMap::from([("disabled_user".to_string(), json!(user))]),
        })
    }
}

/// Offline reputation scorer; a production deployment replaces this with
/// a feed-backed handler registered over it.
pub struct CheckThreatIntelHandler;

#[async_trait]
impl ActionHandler for CheckThreatIntelHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::CheckThreatIntelligence
    }

    async fn execute(
        &self,
        config: &HashMap<String, String>,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome, ActionError> {
        let indicator = ctx.require(config, "indicator").or_else(|_| ctx.require(config, "source_ip"))?;
        let digest = Sha256::digest(indicator.as_bytes());
        let score = (digest[0] as u32 * 100) / 255;
        let verdict = if score >= 70 { "malicious" } else { "unknown" };
        tracing::debug!(%indicator, score, verdict, "threat intel lookup");
        Ok(ActionOutcome {
            payload: json!({"action": "check_threat_intelligence", "indicator": indicator, "score": score, "verdict": verdict}),
            output: HashMap::from([
                ("ti_score".to_string(), json!(score)),
                ("ti_verdict".to_string(), json!(verdict)),
            ]),
        })
    }
}

pub struct SendEmailHandler;

#[async_trait]
impl ActionHandler for SendEmailHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::SendEmail
    }

    async fn execute(
        &self,
        config: &HashMap<String, String>,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome, ActionError> {
        let recipients = config
            .get("recipients")
            .ok_or_else(|| ActionError::MissingParam("recipients".to_string()))?;
        let subject = ctx
            .resolve(config, "subject")
            .or_else(|| ctx.resolve(config, "title"))
            .unwrap_or_else(|| "Security alert".to_string());
        tracing::info!(%recipients, %subject, "email dispatched");
        Ok(ActionOutcome {
            payload: json!({"action": "send_email", "recipients": recipients, "subject": subject}),
            output: HashMap::new(),
        })
    }
}

/// Posts to a Slack-compatible webhook when one is configured; without a
/// webhook the message lands in the service log only.
#[derive(Default)]
pub struct SlackNotificationHandler {
    client: reqwest::Client,
}

#[async_trait]
impl ActionHandler for SlackNotificationHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::SlackNotification
    }

    async fn execute(
        &self,
        config: &HashMap<String, String>,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome, ActionError> {
        let channel = config.get("channel").cloned().unwrap_or_else(|| "#soc-alerts".to_string());
        let text = ctx
            .resolve(config, "message")
            .or_else(|| ctx.resolve(config, "title"))
            .unwrap_or_else(|| "Automated response executed".to_string());

        if let Some(webhook_url) = config.get("webhook_url") {
            self.client
                .post(webhook_url)
                .json(&json!({"channel": channel, "text": text}))
                .send()
                .await
                .map_err(|e| ActionError::Transient(e.to_string()))?
                .error_for_status()
                .map_err(|e| ActionError::Transient(e.to_string()))?;
        } else {
            tracing::info!(%channel, %text, "notification (no webhook configured)");
        }

        Ok(ActionOutcome {
            payload: json!({"action": "slack_notification", "channel": channel, "text": text}),
            output: HashMap::new(),
        })
    }
}

/// Opens a ticket through the ticketing webhook when configured,
/// otherwise issues a local ticket reference.
#[derive(Default)]
pub struct CreateTicketHandler {
    client: reqwest::Client,
}

#[async_trait]
impl ActionHandler for CreateTicketHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::CreateTicket
    }

    async fn execute(
        &self,
        config: &HashMap<String, String>,
        ctx: &ActionContext,
    ) -> Result<ActionOutcome, ActionError> {
        let summary = ctx
            .resolve(config, "summary")
            .or_else(|| ctx.resolve(config, "title"))
            .ok_or_else(|| ActionError::MissingParam("summary".to_string()))?;
        let queue = config.get("queue").cloned().unwrap_or_else(|| "SECOPS".to_string());

        let ticket_id = if let Some(url) = config.get("url") {
            let resp = self
                .client
                .post(url)
                .json(&json!({"queue": queue, "summary": summary}))
                .send()
                .await
                .map_err(|e| ActionError::Transient(e.to_string()))?;
            let data: Value = resp
                .json()
                .await
                .map_err(|e| ActionError::Transient(e.to_string()))?;
            data["ticket_id"]
                .as_str()
                .unwrap_or("unknown")
                .to_string()
        } else {
            format!("{}-{}", queue, &uuid::Uuid::new_v4().to_string()[..8])
        };

        tracing::info!(%ticket_id, %summary, "ticket created");
        Ok(ActionOutcome {
            payload: json!({"action": "create_ticket", "ticket_id": ticket_id, "queue": queue, "summary": summary}),
            output: HashMap::from([("ticket_id".to_string(), json!(ticket_id))]),
        })
    }
}
