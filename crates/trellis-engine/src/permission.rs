use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EventBus, WorkflowEvent};
use trellis_core::types::{AgentPermission, TemplateId};
use trellis_store::SqliteStore;

use crate::expr::{as_number, lookup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAction {
    Initiate,
    Approve,
}

impl fmt::Display for PermissionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiate => f.write_str("initiate"),
            Self::Approve => f.write_str("approve"),
        }
    }
}

/// What an agent is trying to do.
#[derive(Debug, Clone)]
pub struct PermissionQuery<'a> {
    pub agent_id: &'a str,
    pub template_id: &'a TemplateId,
    pub action: PermissionAction,
    /// Approval step being decided.
    pub step_name: Option<&'a str>,
    /// Data the grant's amount field is read from (payload or context).
    pub data: Option<&'a Map<String, Value>>,
    pub reasoning: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_id: Option<String>,
    /// Human-readable summary of the matched grant's conditions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    pub reason: String,
}

impl PermissionDecision {
    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            grant_id: None,
            conditions: None,
            reason: reason.into(),
        }
    }
}

/// Decides whether an agent may initiate a template or decide one of its
/// approval steps. Deny is the default: no matching, unexpired grant whose
/// conditions all hold means no.
pub struct AgentPermissionGate {
    store: Arc<SqliteStore>,
    event_bus: Arc<EventBus>,
}

impl AgentPermissionGate {
    pub fn new(store: Arc<SqliteStore>, event_bus: Arc<EventBus>) -> Self {
        Self { store, event_bus }
    }

    pub fn check(&self, query: &PermissionQuery<'_>) -> Result<PermissionDecision> {
        let now = Utc::now();
        let grants = self.store.permissions_for(query.agent_id, query.template_id)?;

        let mut decision = PermissionDecision::deny(format!(
            "agent '{}' has no grant on template {}",
            query.agent_id, query.template_id
        ));
        for grant in &grants {
            match evaluate_grant(grant, query, now) {
                Ok(()) => {
                    decision = PermissionDecision {
                        allowed: true,
                        grant_id: Some(grant.id.clone()),
                        conditions: Some(describe_conditions(grant)),
                        reason: format!("granted by {}", grant.id),
                    };
                    break;
                }
                Err(reason) => decision = PermissionDecision::deny(reason),
            }
        }

        debug!(
            agent_id = query.agent_id,
            template_id = %query.template_id,
            action = %query.action,
            allowed = decision.allowed,
            "Permission check"
        );
        self.event_bus.publish(WorkflowEvent::PermissionChecked {
            agent_id: query.agent_id.to_string(),
            template_id: query.template_id.clone(),
            action: query.action.to_string(),
            allowed: decision.allowed,
            reason: decision.reason.clone(),
        });
        Ok(decision)
    }

    /// Validate and persist a grant.
    pub fn grant(&self, grant: AgentPermission) -> Result<AgentPermission> {
        if grant.agent_id.trim().is_empty() {
            return Err(TrellisError::Validation("grant needs an agent id".into()));
        }
        if !grant.can_initiate && !grant.can_approve {
            return Err(TrellisError::Validation(
                "grant must allow initiate and/or approve".into(),
            ));
        }
        if grant.conditions.max_amount.is_some_and(|m| m < 0.0 || !m.is_finite()) {
            return Err(TrellisError::Validation(
                "max_amount must be a non-negative number".into(),
            ));
        }
        if self.store.get_template(&grant.template_id)?.is_none() {
            return Err(TrellisError::TemplateNotFound(grant.template_id.0.clone()));
        }
        self.store.insert_permission(&grant)?;
        info!(
            grant_id = %grant.id,
            agent_id = %grant.agent_id,
            template_id = %grant.template_id,
            "Agent permission granted"
        );
        self.event_bus.publish(WorkflowEvent::PermissionGranted {
            grant_id: grant.id.clone(),
            agent_id: grant.agent_id.clone(),
            template_id: grant.template_id.clone(),
            can_initiate: grant.can_initiate,
            can_approve: grant.can_approve,
        });
        Ok(grant)
    }

    pub fn revoke(&self, grant_id: &str) -> Result<bool> {
        let revoked = self.store.revoke_permission(grant_id)?;
        if revoked {
            info!(grant_id, "Agent permission revoked");
            self.event_bus.publish(WorkflowEvent::PermissionRevoked {
                grant_id: grant_id.to_string(),
            });
        }
        Ok(revoked)
    }

    /// Agents holding an unexpired approve grant on the template.
    pub fn approving_agents(&self, template_id: &TemplateId) -> Result<Vec<String>> {
        let mut agents: Vec<String> = self
            .store
            .template_permissions(template_id, true, Utc::now())?
            .into_iter()
            .map(|g| g.agent_id)
            .collect();
        agents.dedup();
        Ok(agents)
    }
}

fn evaluate_grant(
    grant: &AgentPermission,
    query: &PermissionQuery<'_>,
    now: DateTime<Utc>,
) -> std::result::Result<(), String> {
    if grant.is_expired(now) {
        return Err(format!("grant {} has expired", grant.id));
    }
    let granted = match query.action {
        PermissionAction::Initiate => grant.can_initiate,
        PermissionAction::Approve => grant.can_approve,
    };
    if !granted {
        return Err(format!("grant {} does not allow {}", grant.id, query.action));
    }

    let cond = &grant.conditions;
    if let Some(max) = cond.max_amount {
        let amount = query
            .data
            .and_then(|d| lookup(d, &cond.amount_field))
            .and_then(as_number);
        match amount {
            None => {
                return Err(format!(
                    "amount at '{}' is unknown; grant {} is capped at {}",
                    cond.amount_field, grant.id, max
                ))
            }
            Some(amount) if amount > max => {
                return Err(format!(
                    "amount {} exceeds the {} ceiling of grant {}",
                    amount, max, grant.id
                ))
            }
            Some(_) => {}
        }
    }
    if query.action == PermissionAction::Approve && !cond.allowed_steps.is_empty() {
        let allowed = query
            .step_name
            .is_some_and(|s| cond.allowed_steps.iter().any(|a| a == s));
        if !allowed {
            return Err(format!(
                "step '{}' is not among the steps grant {} may approve",
                query.step_name.unwrap_or("?"),
                grant.id
            ));
        }
    }
    if cond.require_reasoning && query.reasoning.map_or(true, |r| r.trim().is_empty()) {
        return Err(format!("grant {} requires reasoning", grant.id));
    }
    Ok(())
}

fn describe_conditions(grant: &AgentPermission) -> String {
    let cond = &grant.conditions;
    if cond.is_unconditional() {
        return "unconditional".to_string();
    }
    let mut parts = Vec::new();
    if let Some(max) = cond.max_amount {
        parts.push(format!("{} <= {}", cond.amount_field, max));
    }
    if !cond.allowed_steps.is_empty() {
        parts.push(format!("steps: {}", cond.allowed_steps.join(", ")));
    }
    if cond.require_reasoning {
        parts.push("reasoning required".to_string());
    }
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use trellis_core::types::{
        ApprovalConfig, PermissionConditions, StepDefinition, StepKind, TemplateDefinition,
    };

    fn setup() -> (AgentPermissionGate, TemplateId) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let tpl = store
            .publish_template(
                &TemplateDefinition::new(
                    "payout",
                    vec![StepDefinition::new(
                        "review",
                        StepKind::Approval(ApprovalConfig {
                            agents: true,
                            ..Default::default()
                        }),
                    )],
                ),
                Utc::now(),
            )
            .unwrap();
        (
            AgentPermissionGate::new(store, Arc::new(EventBus::default())),
            tpl.id,
        )
    }

    fn query<'a>(
        template_id: &'a TemplateId,
        action: PermissionAction,
        data: Option<&'a Map<String, Value>>,
    ) -> PermissionQuery<'a> {
        PermissionQuery {
            agent_id: "bot",
            template_id,
            action,
            step_name: Some("review"),
            data,
            reasoning: None,
        }
    }

    #[test]
    fn deny_by_default() {
        let (gate, tpl) = setup();
        let decision = gate
            .check(&query(&tpl, PermissionAction::Initiate, None))
            .unwrap();
        assert!(!decision.allowed);
        assert!(decision.grant_id.is_none());
    }

    #[test]
    fn amount_ceiling() {
        let (gate, tpl) = setup();
        gate.grant(
            AgentPermission::new("bot", &tpl)
                .initiate()
                .with_conditions(PermissionConditions {
                    max_amount: Some(1000.0),
                    ..Default::default()
                }),
        )
        .unwrap();

        let small = json!({"amount": 500}).as_object().cloned().unwrap();
        let large = json!({"amount": 5000}).as_object().cloned().unwrap();
        let unknown = json!({"other": 1}).as_object().cloned().unwrap();

        let ok = gate
            .check(&query(&tpl, PermissionAction::Initiate, Some(&small)))
            .unwrap();
        assert!(ok.allowed);
        assert_eq!(ok.conditions.as_deref(), Some("amount <= 1000"));

        assert!(!gate
            .check(&query(&tpl, PermissionAction::Initiate, Some(&large)))
            .unwrap()
            .allowed);
        assert!(!gate
            .check(&query(&tpl, PermissionAction::Initiate, Some(&unknown)))
            .unwrap()
            .allowed);
        // Initiate grant does not confer approval
        assert!(!gate
            .check(&query(&tpl, PermissionAction::Approve, Some(&small)))
            .unwrap()
            .allowed);
    }

    #[test]
    fn step_restriction_and_reasoning() {
        let (gate, tpl) = setup();
        gate.grant(
            AgentPermission::new("bot", &tpl)
                .approve()
                .with_conditions(PermissionConditions {
                    allowed_steps: vec!["review".into()],
                    require_reasoning: true,
                    ..Default::default()
                }),
        )
        .unwrap();

        let mut q = query(&tpl, PermissionAction::Approve, None);
        let denied = gate.check(&q).unwrap();
        assert!(!denied.allowed);
        assert!(denied.reason.contains("requires reasoning"));

        q.reasoning = Some("invoice matches PO");
        assert!(gate.check(&q).unwrap().allowed);

        q.step_name = Some("final-signoff");
        assert!(!gate.check(&q).unwrap().allowed);
    }

    #[test]
    fn expired_grants_never_match() {
        let (gate, tpl) = setup();
        let mut grant = AgentPermission::new("bot", &tpl).initiate();
        grant.expires_at = Some(Utc::now() - Duration::seconds(1));
        gate.grant(grant).unwrap();
        let decision = gate
            .check(&query(&tpl, PermissionAction::Initiate, None))
            .unwrap();
        assert!(!decision.allowed);
        assert!(decision.reason.contains("expired"));
    }

    #[test]
    fn invalid_grants_rejected() {
        let (gate, tpl) = setup();
        assert!(gate.grant(AgentPermission::new("bot", &tpl)).is_err());
        assert!(matches!(
            gate.grant(AgentPermission::new("bot", &TemplateId::from_string("tpl_x")).initiate()),
            Err(TrellisError::TemplateNotFound(_))
        ));
    }

    #[test]
    fn approving_agents_lists_approve_grants() {
        let (gate, tpl) = setup();
        gate.grant(AgentPermission::new("approver", &tpl).approve()).unwrap();
        gate.grant(AgentPermission::new("starter", &tpl).initiate()).unwrap();
        assert_eq!(gate.approving_agents(&tpl).unwrap(), vec!["approver"]);
    }

    #[test]
    fn grant_and_revoke_are_published() {
        let (gate, tpl) = setup();
        let mut rx = gate.event_bus.subscribe();

        let grant = gate.grant(AgentPermission::new("bot", &tpl).approve()).unwrap();
        assert!(gate.revoke(&grant.id).unwrap());
        assert!(!gate.revoke(&grant.id).unwrap());

        match rx.try_recv().unwrap() {
            WorkflowEvent::PermissionGranted {
                grant_id,
                agent_id,
                can_approve,
                can_initiate,
                ..
            } => {
                assert_eq!(grant_id, grant.id);
                assert_eq!(agent_id, "bot");
                assert!(can_approve && !can_initiate);
            }
            other => panic!("expected grant event, got {:?}", other),
        }
        assert_eq!(rx.try_recv().unwrap().kind(), "permission_revoked");
        // A revoke that matched nothing publishes nothing
        assert!(rx.try_recv().is_err());
    }
}
