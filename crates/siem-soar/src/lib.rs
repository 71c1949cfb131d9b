//! OpenSIEM Response Engine (SOAR)
//!
//! Security orchestration, automation, and response:
//! - Playbook definitions and trigger matching
//! - A durable execution state machine with approval gating,
//!   per-action timeout and retry budgets, cooperative cancellation,
//!   and compensating rollback
//! - A pluggable action-handler registry
//! - An append-only execution log for audit and rollback decisions
//!
//! # Architecture
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        RESPONSE ENGINE                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  alerts ──► Playbook Matcher ──► Execution Engine                │
//! │                  │                    │        │                 │
//! │                  ▼                    ▼        ▼                 │
//! │           Playbook Store        Action      Execution            │
//! │                                Registry        Log               │
//! │                                                                  │
//! │  operator ──► approve / reject / cancel / rollback               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod actions;
pub mod audit;
pub mod executor;
pub mod matcher;
pub mod playbook;

pub use actions::{
    ActionContext, ActionError, ActionHandler, ActionOutcome, ActionRegistry,
};
pub use audit::{ActionResult, ActionStatus, ExecutionLog};
pub use executor::{
    ApprovalState, ExecutionEngine, ExecutionStatus, ExecutionTrigger, PlaybookExecution,
    SoarConfig,
};
pub use matcher::{MatcherMetrics, PlaybookMatcher};
pub use playbook::{
    ActionKind, ConditionOperator, Playbook, PlaybookAction, PlaybookStats,
    PlaybookStatsSnapshot, PlaybookStore, PlaybookTrigger, TriggerCondition,
};
