//! Per-step-type behavior behind one `execute` contract.

mod action;
mod approval;
mod condition;
mod external;
mod notification;
mod wait;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use trellis_core::context::WorkflowContext;
use trellis_core::error::{ErrorKind, TrellisError};
use trellis_core::types::{Branch, StepExecution, StepType, WakeCondition, WorkflowInstance};

pub use action::ActionStrategy;
pub use approval::{authorize_decider, ApprovalStrategy};
pub use condition::ConditionStrategy;
pub use external::{hash_token, ExternalStrategy};
pub use notification::NotificationStrategy;
pub use wait::{next_cron_fire, WaitStrategy};

/// Everything a strategy sees. The context is passed by value; changes are
/// returned as a patch, never written in place.
pub struct StepContext<'a> {
    pub instance: &'a WorkflowInstance,
    pub context: WorkflowContext,
    /// The step row, including its frozen definition and any resume data.
    pub step: &'a StepExecution,
    pub now: DateTime<Utc>,
}

impl StepContext<'_> {
    /// Key under which this step's output is merged into context.
    pub fn output_key(&self, explicit: Option<&String>) -> String {
        explicit
            .cloned()
            .unwrap_or_else(|| self.step.step_name.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub output: Value,
    pub context_patch: Map<String, Value>,
    pub branch: Branch,
}

impl Resolution {
    /// Resolve with an output recorded on the step but not merged.
    pub fn output_only(output: Value) -> Self {
        Self {
            output,
            context_patch: Map::new(),
            branch: Branch::Continue,
        }
    }

    /// Resolve and merge the output under `key`.
    pub fn merged(key: String, output: Value) -> Self {
        let mut patch = Map::new();
        patch.insert(key, output.clone());
        Self {
            output,
            context_patch: patch,
            branch: Branch::Continue,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suspension {
    pub wake: WakeCondition,
    pub deadline: Option<DateTime<Utc>>,
    pub external_request: Option<Value>,
    pub callback_token_hash: Option<String>,
}

impl Suspension {
    pub fn new(wake: WakeCondition, deadline: Option<DateTime<Utc>>) -> Self {
        Self {
            wake,
            deadline,
            external_request: None,
            callback_token_hash: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub message: String,
    pub retryable: bool,
    pub kind: ErrorKind,
}

impl StepFailure {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            kind: ErrorKind::StepFailure,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            kind: ErrorKind::ExternalRejection,
        }
    }
}

impl From<TrellisError> for StepFailure {
    fn from(e: TrellisError) -> Self {
        let retryable = match &e {
            TrellisError::StepFailure { retryable, .. } => *retryable,
            TrellisError::OperationTimeout { .. }
            | TrellisError::Transport(_)
            | TrellisError::Notification(_) => true,
            _ => false,
        };
        Self {
            message: e.to_string(),
            retryable,
            kind: e.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Resolved(Resolution),
    Suspended(Suspension),
    Failed(StepFailure),
}

impl From<TrellisError> for StepOutcome {
    fn from(e: TrellisError) -> Self {
        StepOutcome::Failed(e.into())
    }
}

/// Behavior of one step type.
pub trait StepStrategy: Send + Sync + 'static {
    fn step_type(&self) -> StepType;

    /// Start the step.
    fn execute<'a>(&'a self, ctx: StepContext<'a>) -> BoxFuture<'a, StepOutcome>;

    /// Finish a suspended step whose awaited event has arrived. The event
    /// data (decision, callback payload) is on `ctx.step`.
    fn resume<'a>(&'a self, ctx: StepContext<'a>) -> BoxFuture<'a, StepOutcome> {
        let _ = ctx;
        Box::pin(async { StepOutcome::Resolved(Resolution::output_only(Value::Null)) })
    }
}

/// Registered strategies, keyed by step type.
#[derive(Clone, Default)]
pub struct StrategySet {
    strategies: HashMap<StepType, Arc<dyn StepStrategy>>,
}

impl StrategySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: Arc<dyn StepStrategy>) {
        self.strategies.insert(strategy.step_type(), strategy);
    }

    pub fn get(&self, step_type: StepType) -> Option<Arc<dyn StepStrategy>> {
        self.strategies.get(&step_type).cloned()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use serde_json::json;
    use trellis_core::types::{
        Actor, InstanceId, InstanceStatus, StepDefinition, TemplateId,
    };

    pub fn instance(context: Value) -> WorkflowInstance {
        let now = Utc::now();
        WorkflowInstance {
            id: InstanceId::from_string("wfi_test"),
            template_id: TemplateId::from_string("tpl_test"),
            template_version: 1,
            tenant: "default".into(),
            status: InstanceStatus::Running,
            step_index: 0,
            context: WorkflowContext::from_payload(&context),
            trigger_payload: context,
            initiator: Actor::user("alice"),
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            completed_at: None,
            deadline: None,
            last_error: None,
            failed_step: None,
            cancel_requested: false,
        }
    }

    pub fn step(definition: StepDefinition) -> StepExecution {
        let mut exec = StepExecution::scheduled(
            &InstanceId::from_string("wfi_test"),
            0,
            &definition,
            Utc::now(),
        );
        exec.attempt = 1;
        exec.input = json!({});
        exec
    }

    pub fn ctx<'a>(instance: &'a WorkflowInstance, step: &'a StepExecution) -> StepContext<'a> {
        StepContext {
            instance,
            context: instance.context.clone(),
            step,
            now: Utc::now(),
        }
    }
}
