//! Execution Log
//!
//! Append-only record of every action attempt across all playbook
//! executions. The log, not the in-memory execution record, is the
//! source of truth for what actually happened: rollback decisions and
//! compliance exports read from here.

use crate::playbook::ActionKind;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use siem_common::{SiemError, SiemResult};
use std::collections::HashMap;

/// Status of one action attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Timeout,
}

impl ActionStatus {
    /// Failures for retry accounting (timeouts count).
    pub fn is_failure(self) -> bool {
        matches!(self, ActionStatus::Failed | ActionStatus::Timeout)
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Running => "running",
            ActionStatus::Success => "success",
            ActionStatus::Failed => "failed",
            ActionStatus::Skipped => "skipped",
            ActionStatus::Timeout => "timeout",
        }
    }
}

/// One logged action attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub id: String,
    pub execution_id: String,
    /// Total order within the execution; attempts of a later action
    /// always carry higher numbers than attempts of an earlier one
    pub seq: u32,
    pub action_id: String,
    pub action_name: String,
    pub kind: ActionKind,
    pub status: ActionStatus,
    /// Zero-based attempt number (retries so far)
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Structured handler result
    pub payload: Value,
    pub error: Option<String>,
    /// Variables exported to subsequent actions
    #[serde(default)]
    pub output: HashMap<String, Value>,
    /// True when this entry is a compensating (rollback) invocation
    pub rollback: bool,
}

/// Append-only per-execution log.
pub struct ExecutionLog {
    entries: DashMap<String, Mutex<Vec<ActionResult>>>,
}

impl ExecutionLog {
    /// Empty log.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Next sequence number for an execution.
    pub fn next_seq(&self, execution_id: &str) -> u32 {
        self.entries
            .get(execution_id)
            .map(|log| log.lock().len() as u32)
            .unwrap_or(0)
    }

    /// Append one attempt. The sequence number must continue the
    /// execution's log exactly; anything else is a contract violation.
    pub fn append(&self, result: ActionResult) -> SiemResult<()> {
        let log = self
            .entries
            .entry(result.execution_id.clone())
            .or_insert_with(|| Mutex::new(Vec::new()));
        let mut log = log.lock();
        if result.seq != log.len() as u32 {
            return Err(SiemError::AppendOnlyViolation {
                kind: "action_result",
                id: result.id,
                reason: format!(
                    "seq {} does not continue log of length {}",
                    result.seq,
                    log.len()
                ),
            });
        }
        log.push(result);
        Ok(())
    }

    /// Full ordered log of one execution.
    pub fn for_execution(&self, execution_id: &str) -> Vec<ActionResult> {
        self.entries
            .get(execution_id)
            .map(|log| log.lock().clone())
            .unwrap_or_default()
    }

    /// Succeeded non-rollback attempts of one execution, in order. One
    /// entry per succeeded action: an action succeeds at most once.
    pub fn succeeded(&self, execution_id: &str) -> Vec<ActionResult> {
        self.for_execution(execution_id)
            .into_iter()
            .filter(|r| r.status == ActionStatus::Success && !r.rollback)
            .collect()
    }

    /// Number of executions with log entries.
    pub fn execution_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new()
    }
}
