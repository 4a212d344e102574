use std::sync::Arc;

use chrono::Duration;
use futures::future::BoxFuture;
use serde_json::json;
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::{
    Actor, ApprovalConfig, ApproverSet, Decision, StepExecution, StepKind, StepType,
    WakeCondition, WorkflowInstance,
};

use super::{Resolution, StepContext, StepFailure, StepOutcome, StepStrategy, Suspension};
use crate::permission::{AgentPermissionGate, PermissionAction, PermissionQuery};

/// Suspends until an authorized approver decides.
pub struct ApprovalStrategy {
    gate: Arc<AgentPermissionGate>,
    default_timeout_secs: u64,
}

impl ApprovalStrategy {
    pub fn new(gate: Arc<AgentPermissionGate>, default_timeout_secs: u64) -> Self {
        Self {
            gate,
            default_timeout_secs,
        }
    }
}

impl StepStrategy for ApprovalStrategy {
    fn step_type(&self) -> StepType {
        StepType::Approval
    }

    fn execute<'a>(&'a self, ctx: StepContext<'a>) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            let StepKind::Approval(cfg) = &ctx.step.config_snapshot.kind else {
                return StepOutcome::Failed(StepFailure::fatal("not an approval step"));
            };

            let agents = if cfg.agents {
                match self.gate.approving_agents(&ctx.instance.template_id) {
                    Ok(agents) => agents,
                    Err(e) => return e.into(),
                }
            } else {
                Vec::new()
            };
            let approvers = ApproverSet {
                users: cfg.users.clone(),
                roles: cfg.roles.clone(),
                agents,
            };

            let timeout = ctx
                .step
                .config_snapshot
                .timeout_secs
                .unwrap_or(self.default_timeout_secs);
            let deadline = (timeout > 0).then(|| ctx.now + Duration::seconds(timeout as i64));

            debug!(
                instance_id = %ctx.instance.id,
                step = %ctx.step.step_name,
                users = approvers.users.len(),
                roles = approvers.roles.len(),
                agents = approvers.agents.len(),
                "Awaiting approval"
            );
            StepOutcome::Suspended(Suspension::new(WakeCondition::Decision { approvers }, deadline))
        })
    }

    fn resume<'a>(&'a self, ctx: StepContext<'a>) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            let step = ctx.step;
            let decided_by = step.decided_by.clone().unwrap_or_default();
            match step.decision {
                Some(Decision::Approve) => StepOutcome::Resolved(Resolution::merged(
                    step.step_name.clone(),
                    json!({
                        "decision": "approve",
                        "decided_by": decided_by,
                        "reason": step.decision_reason,
                    }),
                )),
                Some(Decision::Reject) => StepOutcome::Failed(StepFailure::rejected(format!(
                    "rejected by {}{}",
                    decided_by,
                    step.decision_reason
                        .as_deref()
                        .map(|r| format!(": {}", r))
                        .unwrap_or_default()
                ))),
                None => StepOutcome::Failed(StepFailure::fatal("resumed without a decision")),
            }
        })
    }
}

/// Check that `decider` may decide the approval step `step`.
///
/// Humans (and API keys) must be listed by id or hold a listed role. Agents
/// need the step to admit agents and a currently valid approve grant whose
/// conditions hold against the instance context.
pub fn authorize_decider(
    gate: &AgentPermissionGate,
    instance: &WorkflowInstance,
    step: &StepExecution,
    decider: &Actor,
    reasoning: Option<&str>,
) -> Result<()> {
    let deny = |reason: String| TrellisError::NotAuthorized {
        instance_id: instance.id.0.clone(),
        step_index: step.step_index,
        reason,
    };

    let StepKind::Approval(cfg) = &step.config_snapshot.kind else {
        return Err(deny("step is not an approval step".into()));
    };
    let approvers = match &step.wake_condition {
        Some(WakeCondition::Decision { approvers }) => approvers.clone(),
        _ => ApproverSet {
            users: cfg.users.clone(),
            roles: cfg.roles.clone(),
            agents: Vec::new(),
        },
    };

    if let Some(agent_id) = decider.agent_ref() {
        return authorize_agent(gate, instance, step, cfg, agent_id, reasoning).map_err(deny);
    }

    let listed = approvers.users.iter().any(|u| u == &decider.id);
    let has_role = decider
        .roles
        .iter()
        .any(|r| approvers.roles.iter().any(|a| a == r));
    if listed || has_role {
        Ok(())
    } else {
        Err(deny(format!(
            "{} is not an approver of step '{}'",
            decider.label(),
            step.step_name
        )))
    }
}

fn authorize_agent(
    gate: &AgentPermissionGate,
    instance: &WorkflowInstance,
    step: &StepExecution,
    cfg: &ApprovalConfig,
    agent_id: &str,
    reasoning: Option<&str>,
) -> std::result::Result<(), String> {
    if !cfg.agents {
        return Err(format!("step '{}' does not admit agent approvers", step.step_name));
    }
    let decision = gate
        .check(&PermissionQuery {
            agent_id,
            template_id: &instance.template_id,
            action: PermissionAction::Approve,
            step_name: Some(&step.step_name),
            data: Some(instance.context.data()),
            reasoning,
        })
        .map_err(|e| e.to_string())?;
    if decision.allowed {
        Ok(())
    } else {
        Err(decision.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use trellis_core::event::EventBus;
    use trellis_core::types::{
        AgentPermission, PermissionConditions, StepDefinition, TemplateDefinition,
    };
    use trellis_store::SqliteStore;

    use crate::strategy::testing;

    fn approval_def(agents: bool) -> StepDefinition {
        StepDefinition::new(
            "review",
            StepKind::Approval(ApprovalConfig {
                users: vec!["manager".into()],
                roles: vec!["finance".into()],
                agents,
                message: None,
            }),
        )
        .with_timeout(3600)
    }

    fn gate_with_template(agents: bool) -> (Arc<AgentPermissionGate>, WorkflowInstance) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let tpl = store
            .publish_template(
                &TemplateDefinition::new("payout", vec![approval_def(agents)]),
                Utc::now(),
            )
            .unwrap();
        let gate = Arc::new(AgentPermissionGate::new(store, Arc::new(EventBus::default())));
        let mut instance = testing::instance(json!({"amount": 800}));
        instance.template_id = tpl.id;
        (gate, instance)
    }

    #[tokio::test]
    async fn suspends_with_resolved_approvers_and_deadline() {
        let (gate, instance) = gate_with_template(true);
        gate.grant(AgentPermission::new("bot", &instance.template_id).approve())
            .unwrap();
        let strategy = ApprovalStrategy::new(gate, 86_400);
        let step = testing::step(approval_def(true));
        let ctx = testing::ctx(&instance, &step);
        let now = ctx.now;

        match strategy.execute(ctx).await {
            StepOutcome::Suspended(s) => {
                assert_eq!(s.deadline, Some(now + Duration::seconds(3600)));
                match s.wake {
                    WakeCondition::Decision { approvers } => {
                        assert_eq!(approvers.users, vec!["manager"]);
                        assert_eq!(approvers.agents, vec!["bot"]);
                    }
                    other => panic!("unexpected wake {:?}", other),
                }
            }
            other => panic!("expected suspension, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn resume_maps_decisions() {
        let (gate, instance) = gate_with_template(false);
        let strategy = ApprovalStrategy::new(gate, 60);

        let mut step = testing::step(approval_def(false));
        step.decision = Some(Decision::Approve);
        step.decided_by = Some("user:manager".into());
        match strategy.resume(testing::ctx(&instance, &step)).await {
            StepOutcome::Resolved(r) => {
                assert_eq!(r.context_patch["review"]["decision"], "approve");
            }
            other => panic!("expected resolution, got {:?}", other),
        }

        step.decision = Some(Decision::Reject);
        step.decision_reason = Some("over budget".into());
        match strategy.resume(testing::ctx(&instance, &step)).await {
            StepOutcome::Failed(f) => {
                assert_eq!(f.kind, trellis_core::error::ErrorKind::ExternalRejection);
                assert!(f.message.contains("over budget"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn human_authorization_by_id_or_role() {
        let (gate, instance) = gate_with_template(false);
        let step = testing::step(approval_def(false));

        assert!(authorize_decider(&gate, &instance, &step, &Actor::user("manager"), None).is_ok());
        assert!(authorize_decider(
            &gate,
            &instance,
            &step,
            &Actor::user("carol").with_roles(&["finance"]),
            None
        )
        .is_ok());
        assert!(matches!(
            authorize_decider(&gate, &instance, &step, &Actor::user("mallory"), None),
            Err(TrellisError::NotAuthorized { .. })
        ));
    }

    #[test]
    fn agent_authorization_goes_through_gate() {
        let (gate, instance) = gate_with_template(true);
        let step = testing::step(approval_def(true));
        let agent = Actor::agent("bot");

        assert!(authorize_decider(&gate, &instance, &step, &agent, None).is_err());

        gate.grant(
            AgentPermission::new("bot", &instance.template_id)
                .approve()
                .with_conditions(PermissionConditions {
                    max_amount: Some(1000.0),
                    ..Default::default()
                }),
        )
        .unwrap();
        assert!(authorize_decider(&gate, &instance, &step, &agent, None).is_ok());

        // Steps that do not admit agents refuse them regardless of grants
        let human_only = testing::step(approval_def(false));
        assert!(authorize_decider(&gate, &instance, &human_only, &agent, None).is_err());
    }
}
